pub mod notifier;

pub use notifier::{NoopNotifier, NotificationDispatcher, Notifier};
