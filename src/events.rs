// cancapture/src/events.rs
//
// Implements event fan-out to registered listeners.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Typed event fan-out.
//!
//! The channel and the log store publish events to any number of
//! listeners. A listener is a closure invoked on the publishing thread, or
//! the sending half of an `mpsc` channel for consumers that want to drain
//! events on their own thread.

use std::{
    fmt,
    sync::{mpsc, Arc, Mutex, MutexGuard},
};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A set of listeners for events of type `E`.
pub struct Subscribers<E> {
    listeners: Mutex<Vec<Listener<E>>>,
}

impl<E> Subscribers<E> {
    /// Creates an empty set of listeners.
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Registers a listener closure.
    pub fn add<F>(&self, listener: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.lock().push(Arc::new(listener));
    }

    /// Gets the number of registered listeners.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Determines if there are no listeners.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers the event to every listener, in registration order.
    ///
    /// The listeners are called without holding the list lock, so a
    /// listener may publish again or register other listeners. A listener
    /// added while an event is being delivered only sees later events.
    pub fn publish(&self, event: &E) {
        let listeners = self.lock().clone();
        for listener in listeners {
            listener(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Listener<E>>> {
        // A listener that panicked leaves the list itself intact.
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<E: Clone + Send + 'static> Subscribers<E> {
    /// Registers a listener that forwards a copy of every event into a
    /// channel, returning the receiving end.
    ///
    /// Events published after the receiver is dropped are discarded.
    pub fn channel(&self) -> mpsc::Receiver<E> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        self.add(move |event: &E| {
            if let Ok(tx) = tx.lock() {
                let _ = tx.send(event.clone());
            }
        });
        rx
    }
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Subscribers<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Subscribers {{ listeners: {} }}", self.len())
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn test_publish_order() {
        let subs = Subscribers::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let seen = Arc::clone(&seen);
            subs.add(move |ev: &u32| seen.lock().unwrap().push((tag, *ev)));
        }
        assert_eq!(subs.len(), 3);

        subs.publish(&7);
        assert_eq!(*seen.lock().unwrap(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn test_channel_listener() {
        let subs = Subscribers::<String>::new();
        let rx = subs.channel();

        subs.publish(&"one".to_string());
        subs.publish(&"two".to_string());

        assert_eq!(rx.try_recv().unwrap(), "one");
        assert_eq!(rx.try_recv().unwrap(), "two");
        assert!(rx.try_recv().is_err());

        // Publishing into a dropped receiver is harmless
        drop(rx);
        subs.publish(&"three".to_string());
    }

    #[test]
    fn test_publish_from_listener() {
        let subs = Arc::new(Subscribers::<u32>::new());
        let rx = subs.channel();

        let inner = Arc::clone(&subs);
        subs.add(move |ev: &u32| {
            if *ev == 0 {
                inner.publish(&1);
                // Registering from inside a listener is fine too
                inner.add(|_| ());
            }
        });

        let (done_tx, done_rx) = mpsc::channel();
        let thr_subs = Arc::clone(&subs);
        std::thread::spawn(move || {
            thr_subs.publish(&0);
            let _ = done_tx.send(());
        });

        done_rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .expect("nested publish never returned");
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(subs.len(), 3);
    }

    #[test]
    fn test_no_listeners() {
        let subs = Subscribers::<()>::default();
        let count = Arc::new(AtomicUsize::new(0));
        assert!(subs.is_empty());
        subs.publish(&());

        let c = Arc::clone(&count);
        subs.add(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        subs.publish(&());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
