pub mod config;
pub mod domain;
pub mod errors;

pub use domain::book::{Book, Isbn, SearchField, LOW_STOCK_THRESHOLD};
pub use domain::customer::{Customer, CustomerId};
pub use domain::order::{
    NewOrderLine, OrderDetails, OrderId, OrderItem, OrderReceipt, OrderStatus, ReceiptLine,
};
pub use domain::session::{Message, MessageRole, Session, SessionId, ToolCallRecord};
pub use errors::{ApplicationError, InterfaceError, ToolError};
