pub mod queue_message;

pub use queue_message::{MessageData, QueueMessage};
