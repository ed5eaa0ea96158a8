// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Fires a one-time stop signal to every task holding a [`Shutdown`].
///
/// Dropping every trigger also releases the listeners, so tasks never outlive
/// the object that owns them.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    notify: broadcast::Sender<()>,
    fired: Arc<AtomicBool>,
}

impl ShutdownTrigger {
    pub fn new() -> ShutdownTrigger {
        let (notify, _) = broadcast::channel(1);
        ShutdownTrigger {
            notify,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Listeners must subscribe before the trigger fires to observe it.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown::new(self.notify.subscribe())
    }

    /// Returns `true` only for the call that actually fired the signal.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        // no listeners left is fine, there is nobody to stop
        let _ = self.notify.send(());
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Resolves once the signal fired or every trigger was dropped.
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}
