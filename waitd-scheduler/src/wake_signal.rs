// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A re-armable version of `async_latch::AsyncLatch`: where a latch can only
//! ever fire once (triggering by dropping its sender), the scheduler needs
//! to be woken repeatedly — once per `AddJob`/`UpdateJob`/`CancelJob` call —
//! while it sleeps toward the earliest job's next check time. Generalizing
//! the same underlying primitive (`tokio::sync::watch`) from a one-shot
//! trigger to a monotonic counter gives exactly that: `notify` bumps the
//! counter instead of consuming the sender, and `woken` waits for the next
//! bump instead of for the sender's drop.

use tokio::sync::watch;

#[derive(Clone)]
pub struct WakeSignal {
  sender: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct WakeReceiver {
  receiver: watch::Receiver<u64>,
}

impl WakeSignal {
  pub fn channel() -> (WakeSignal, WakeReceiver) {
    let (sender, receiver) = watch::channel(0u64);
    (WakeSignal { sender }, WakeReceiver { receiver })
  }

  /// Wakes every current waiter. Calls before any receiver is waiting are
  /// not lost — `watch` always remembers the latest value.
  pub fn notify(&self) {
    self.sender.send_modify(|generation| *generation = generation.wrapping_add(1));
  }
}

impl WakeReceiver {
  /// Resolves the next time `notify` is called after this call begins.
  pub async fn woken(&mut self) {
    let _ = self.receiver.changed().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn notify_wakes_a_pending_waiter() {
    let (signal, mut receiver) = WakeSignal::channel();
    let task = tokio::spawn(async move {
      receiver.woken().await;
    });
    tokio::task::yield_now().await;
    signal.notify();
    task.await.unwrap();
  }
}
