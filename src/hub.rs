//! In-process pub/sub used to carry lifecycle and log events to observers (the UI). De-genericized
//! from `roboplc::hub`'s `DataDeliveryPolicy`/`pchannel` machinery to a plain `std::sync::mpsc`
//! backing, since this crate does not carry `rtsc`; the registration/condition-function/priority
//! shape is kept as-is.

use std::sync::{mpsc, Arc};

use parking_lot::Mutex;

use crate::{controller::TaskName, Error, Result};

/// The hub prelude.
pub mod prelude {
    pub use super::{Hub, LogErrorPacket, LogEvent, LogLevel, LogPacket};
}

type ConditionFunction<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// The severity of a [`LogPacket`], mirroring the original `LogLevel` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Informational message.
    Info,
    /// A task was forcibly stopped (interrupt thrown, body did not handle it) or a watchdog fired.
    Warn,
    /// A task crashed.
    Error,
}

/// A plain log line, tagged with the task that emitted it.
#[derive(Debug, Clone)]
pub struct LogPacket {
    /// The message parts, concatenated by the observer the way `print(*args)` would.
    pub parts: Vec<String>,
    /// The severity.
    pub level: LogLevel,
    /// The emitting task's name.
    pub task_name: TaskName,
}

/// A structured error report, emitted on a task crash.
#[derive(Debug, Clone)]
pub struct LogErrorPacket {
    /// A human-readable error message.
    pub message: String,
    /// An optional traceback/backtrace string.
    pub traceback: Option<String>,
    /// The crashing task's name.
    pub task_name: TaskName,
}

/// The single observable event kind carried over the log hub (spec §6.4).
#[derive(Debug, Clone)]
pub enum LogEvent {
    /// A plain log line.
    Packet(LogPacket),
    /// A crash report.
    Error(LogErrorPacket),
}

/// A synchronous in-process pub/sub hub, following `roboplc::hub::Hub`'s registration/condition
/// shape but backed by `std::sync::mpsc` instead of `rtsc::pchannel`.
pub struct Hub<T: Clone> {
    inner: Arc<Mutex<HubInner<T>>>,
}

impl<T: Clone> Clone for Hub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Default for Hub<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                subscriptions: Vec::new(),
            })),
        }
    }
}

impl<T: Clone> Hub<T> {
    /// Creates a new, empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends a message to every subscribed client whose condition function matches. Ignores send
    /// errors from individual dead clients.
    pub fn send(&self, message: T) {
        let targets: Vec<Arc<Subscription<T>>> = self
            .inner
            .lock()
            .subscriptions
            .iter()
            .filter(|c| (c.condition)(&message))
            .cloned()
            .collect();
        for sub in &targets {
            let _ = sub.tx.send(message.clone());
        }
    }

    /// Registers a client with an unconditional subscription (receives every message).
    pub fn subscribe(&self, name: &str) -> Result<Client<T>> {
        self.register(name, |_| true)
    }

    /// Registers a regular client. `condition` decides which messages are delivered to it.
    pub fn register<F>(&self, name: &str, condition: F) -> Result<Client<T>>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let name: Arc<str> = name.into();
        let mut inner = self.inner.lock();
        if inner.subscriptions.iter().any(|s| s.name == name) {
            return Err(Error::HubAlreadyRegistered(name));
        }
        let (tx, rx) = mpsc::channel();
        inner.subscriptions.push(Arc::new(Subscription {
            name: name.clone(),
            tx,
            condition: Box::new(condition),
        }));
        Ok(Client {
            name,
            hub: self.clone(),
            rx,
        })
    }

    fn unregister(&self, name: &str) {
        self.inner.lock().subscriptions.retain(|s| &*s.name != name);
    }
}

struct HubInner<T: Clone> {
    subscriptions: Vec<Arc<Subscription<T>>>,
}

struct Subscription<T: Clone> {
    name: Arc<str>,
    tx: mpsc::Sender<T>,
    condition: ConditionFunction<T>,
}

/// A registered hub client: a receiving end plus a handle back to the hub for sending.
pub struct Client<T: Clone> {
    name: Arc<str>,
    hub: Hub<T>,
    rx: mpsc::Receiver<T>,
}

impl<T: Clone> Client<T> {
    /// Sends a message to every hub-subscribed client, including potentially itself.
    pub fn send(&self, message: T) {
        self.hub.send(message);
    }
    /// Receives a message, blocking until one is available or every sender (hub) is dropped.
    pub fn recv(&self) -> Result<T> {
        self.rx.recv().map_err(|_| Error::HubClientNotFound(self.name.clone()))
    }
    /// Receives a message without blocking.
    pub fn try_recv(&self) -> Result<T> {
        self.rx
            .try_recv()
            .map_err(|_| Error::HubClientNotFound(self.name.clone()))
    }
}

impl<T: Clone> Iterator for Client<T> {
    type Item = T;
    fn next(&mut self) -> Option<Self::Item> {
        self.recv().ok()
    }
}

impl<T: Clone> Drop for Client<T> {
    fn drop(&mut self) {
        self.hub.unregister(&self.name);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_register_and_send() {
        let hub: Hub<LogEvent> = Hub::new();
        let client = hub.subscribe("observer").unwrap();
        hub.send(LogEvent::Packet(LogPacket {
            parts: vec!["hello".into()],
            level: LogLevel::Info,
            task_name: TaskName::Anonymous(1),
        }));
        let event = client.try_recv().expect("message should be delivered");
        match event {
            LogEvent::Packet(p) => assert_eq!(p.parts, vec!["hello".to_string()]),
            LogEvent::Error(_) => panic!("expected a packet"),
        }
    }

    #[test]
    fn test_duplicate_registration_errors() {
        let hub: Hub<LogEvent> = Hub::new();
        let _a = hub.subscribe("dup").unwrap();
        assert!(hub.subscribe("dup").is_err());
    }

    #[test]
    fn test_condition_filters_messages() {
        let hub: Hub<LogEvent> = Hub::new();
        let errors_only = hub
            .register("errors", |e| matches!(e, LogEvent::Error(_)))
            .unwrap();
        hub.send(LogEvent::Packet(LogPacket {
            parts: vec![],
            level: LogLevel::Info,
            task_name: TaskName::Anonymous(1),
        }));
        assert!(errors_only.try_recv().is_err());
        hub.send(LogEvent::Error(LogErrorPacket {
            message: "boom".into(),
            traceback: None,
            task_name: TaskName::Anonymous(1),
        }));
        assert!(errors_only.try_recv().is_ok());
    }

    #[test]
    fn test_unregister_on_drop() {
        let hub: Hub<LogEvent> = Hub::new();
        {
            let _c = hub.subscribe("temp").unwrap();
            assert!(hub.subscribe("temp").is_err());
        }
        assert!(hub.subscribe("temp").is_ok());
    }
}
