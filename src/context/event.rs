//! Context events and listeners.

use std::fmt;
use std::sync::Arc;

use crate::table::DataTable;

pub const E_CHILD_ADDED: &str = "childAdded";
pub const E_CHILD_REMOVED: &str = "childRemoved";
pub const E_VARIABLE_ADDED: &str = "variableAdded";
pub const E_VARIABLE_REMOVED: &str = "variableRemoved";
pub const E_FUNCTION_ADDED: &str = "functionAdded";
pub const E_FUNCTION_REMOVED: &str = "functionRemoved";
pub const E_EVENT_ADDED: &str = "eventAdded";
pub const E_EVENT_REMOVED: &str = "eventRemoved";
pub const E_ACTION_ADDED: &str = "actionAdded";
pub const E_ACTION_REMOVED: &str = "actionRemoved";
pub const E_ACTION_STATE_CHANGED: &str = "actionStateChanged";
pub const E_INFO_CHANGED: &str = "infoChanged";
pub const E_DESTROYED: &str = "destroyed";
pub const E_VISIBLE_CHILD_ADDED: &str = "visibleChildAdded";
pub const E_VISIBLE_CHILD_REMOVED: &str = "visibleChildRemoved";
pub const E_CHANGE: &str = "change";
pub const E_UPDATED: &str = "updated";
pub const E_CONTEXT_STATUS_CHANGED: &str = "contextStatusChanged";

pub const EF_CHILD: &str = "child";
pub const EF_NAME: &str = "name";
pub const EF_VARIABLE: &str = "variable";
pub const EF_PATH: &str = "path";
pub const EF_STATUS: &str = "status";
pub const EF_COMMENT: &str = "comment";

/// Events a proxy node interprets itself. Anything else is [`EventKind::Custom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChildAdded,
    ChildRemoved,
    VariableAdded,
    VariableRemoved,
    FunctionAdded,
    FunctionRemoved,
    EventAdded,
    EventRemoved,
    ActionAdded,
    ActionRemoved,
    ActionStateChanged,
    InfoChanged,
    Destroyed,
    VisibleChildAdded,
    VisibleChildRemoved,
    Change,
    Updated,
    ContextStatusChanged,
    Custom,
}

impl EventKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            E_CHILD_ADDED => EventKind::ChildAdded,
            E_CHILD_REMOVED => EventKind::ChildRemoved,
            E_VARIABLE_ADDED => EventKind::VariableAdded,
            E_VARIABLE_REMOVED => EventKind::VariableRemoved,
            E_FUNCTION_ADDED => EventKind::FunctionAdded,
            E_FUNCTION_REMOVED => EventKind::FunctionRemoved,
            E_EVENT_ADDED => EventKind::EventAdded,
            E_EVENT_REMOVED => EventKind::EventRemoved,
            E_ACTION_ADDED => EventKind::ActionAdded,
            E_ACTION_REMOVED => EventKind::ActionRemoved,
            E_ACTION_STATE_CHANGED => EventKind::ActionStateChanged,
            E_INFO_CHANGED => EventKind::InfoChanged,
            E_DESTROYED => EventKind::Destroyed,
            E_VISIBLE_CHILD_ADDED => EventKind::VisibleChildAdded,
            E_VISIBLE_CHILD_REMOVED => EventKind::VisibleChildRemoved,
            E_CHANGE => EventKind::Change,
            E_UPDATED => EventKind::Updated,
            E_CONTEXT_STATUS_CHANGED => EventKind::ContextStatusChanged,
            _ => EventKind::Custom,
        }
    }

    /// The server delivers these to every client without a subscription.
    pub fn is_auto_listened(self) -> bool {
        !matches!(
            self,
            EventKind::Change
                | EventKind::Updated
                | EventKind::ContextStatusChanged
                | EventKind::Custom
        )
    }
}

/// Event delivered to a proxy node, with its payload decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextEvent {
    /// Local path of the context the event belongs to.
    pub context: String,
    pub name: String,
    pub kind: EventKind,
    pub level: i32,
    pub id: Option<i64>,
    pub listener: Option<i64>,
    pub data: DataTable,
    /// Milliseconds since the epoch.
    pub creation_time: Option<i64>,
}

impl ContextEvent {
    pub fn new(context: impl Into<String>, name: impl Into<String>, data: DataTable) -> Self {
        let name = name.into();
        Self {
            context: context.into(),
            kind: EventKind::from_name(&name),
            name,
            level: 0,
            id: None,
            listener: None,
            data,
            creation_time: None,
        }
    }

    /// String field of the first data record.
    pub fn field(&self, field: &str) -> Option<&str> {
        self.data.rec().and_then(|r| r.string(field))
    }
}

/// Receives events of one context.
pub trait ContextEventListener: Send + Sync + 'static {
    fn handle(&self, event: &ContextEvent);
}

impl<F> ContextEventListener for F
where
    F: Fn(&ContextEvent) + Send + Sync + 'static,
{
    fn handle(&self, event: &ContextEvent) {
        self(event)
    }
}

/// Remote subscription parameters of a listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Listener code sent to the server; events carry it back.
    pub code: Option<i64>,
    pub filter: Option<String>,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Clone)]
pub(crate) struct ListenerEntry {
    pub(crate) id: ListenerId,
    pub(crate) options: ListenerOptions,
    pub(crate) listener: Arc<dyn ContextEventListener>,
}

impl ListenerEntry {
    /// Listeners with a code only see events delivered for that code.
    pub(crate) fn accepts(&self, event: &ContextEvent) -> bool {
        match (self.options.code, event.listener) {
            (Some(code), Some(delivered)) => code == delivered,
            _ => true,
        }
    }
}

impl fmt::Debug for ListenerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerEntry")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Record;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_kind_from_name() {
        assert_eq!(EventKind::from_name("childAdded"), EventKind::ChildAdded);
        assert_eq!(EventKind::from_name("updated"), EventKind::Updated);
        assert_eq!(EventKind::from_name("alarm"), EventKind::Custom);
    }

    #[test]
    fn test_auto_listened() {
        assert!(EventKind::ChildAdded.is_auto_listened());
        assert!(EventKind::Destroyed.is_auto_listened());
        assert!(!EventKind::Change.is_auto_listened());
        assert!(!EventKind::ContextStatusChanged.is_auto_listened());
        assert!(!EventKind::Custom.is_auto_listened());
    }

    #[test]
    fn test_event_field() {
        let event = ContextEvent::new(
            "users",
            E_CHILD_ADDED,
            DataTable::single(Record::new().with(EF_CHILD, "admin")),
        );
        assert_eq!(event.kind, EventKind::ChildAdded);
        assert_eq!(event.field(EF_CHILD), Some("admin"));
        assert_eq!(event.field(EF_NAME), None);
    }

    #[test]
    fn test_closure_listener_and_code_filter() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let entry = ListenerEntry {
            id: ListenerId(1),
            options: ListenerOptions {
                code: Some(7),
                ..Default::default()
            },
            listener: Arc::new(move |_: &ContextEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        };

        let mut event = ContextEvent::new("users", "alarm", DataTable::new());
        event.listener = Some(3);
        assert!(!entry.accepts(&event));
        event.listener = Some(7);
        assert!(entry.accepts(&event));

        entry.listener.handle(&event);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
