pub mod ticket_chat;

// Re-export commonly used items
pub use ticket_chat::{rest_history_loader, Conversation, HistoryLoader, HistorySink, TicketChatSession};
