mod schema;
mod subscriptions;
mod types;

pub use schema::Database;
pub use types::{CategorySubscription, DatabaseError, GuildSubscription};
