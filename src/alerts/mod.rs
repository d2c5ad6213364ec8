/// Notify-once-per-cooldown gate
pub mod debouncer;
/// Alert mail formatting and delivery
pub mod dispatcher;
/// Expiring key-value stores for silence records
pub mod store;

pub use debouncer::KeywordDebouncer;
pub use dispatcher::{AlertDispatcher, LogMailer, Mailer, SentMail, SmtpMailer};
pub use store::{ExpiringStore, InMemoryExpiringStore, RedisExpiringStore};
