//! The six desk tools: argument parsing, JSON schemas and execution against a
//! [`LibraryStore`].
//!
//! Model output arrives as a tool name plus a JSON argument string. It is turned
//! into a [`ToolCall`] at the boundary; anything that does not parse becomes an
//! `invalid_input` payload the model can react to.

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use bookdesk_core::domain::book::{Book, Isbn, SearchField, LOW_STOCK_THRESHOLD};
use bookdesk_core::domain::customer::CustomerId;
use bookdesk_core::domain::order::{round_money, NewOrderLine, OrderId};
use bookdesk_core::domain::session::ToolCallRecord;
use bookdesk_core::errors::ToolError;
use bookdesk_db::LibraryStore;

use crate::llm::ToolSchema;

pub const FIND_BOOKS: &str = "find_books";
pub const CREATE_ORDER: &str = "create_order";
pub const RESTOCK_BOOK: &str = "restock_book";
pub const UPDATE_PRICE: &str = "update_price";
pub const ORDER_STATUS: &str = "order_status";
pub const INVENTORY_SUMMARY: &str = "inventory_summary";

#[derive(Clone, Debug, PartialEq)]
pub enum ToolCall {
    FindBooks { query: String, by: SearchField },
    CreateOrder { customer_id: CustomerId, items: Vec<NewOrderLine> },
    RestockBook { isbn: Isbn, quantity: i64 },
    UpdatePrice { isbn: Isbn, price: Decimal },
    OrderStatus { order_id: OrderId },
    InventorySummary,
}

#[derive(Deserialize)]
struct FindBooksArgs {
    query: String,
    #[serde(default)]
    by: Option<String>,
}

#[derive(Deserialize)]
struct CreateOrderArgs {
    customer_id: i64,
    items: Vec<NewOrderLine>,
}

#[derive(Deserialize)]
struct RestockArgs {
    isbn: String,
    qty: i64,
}

#[derive(Deserialize)]
struct UpdatePriceArgs {
    isbn: String,
    price: Decimal,
}

#[derive(Deserialize)]
struct OrderStatusArgs {
    order_id: i64,
}

impl ToolCall {
    pub fn parse(name: &str, arguments: &str) -> Result<Self, ToolError> {
        let arguments = parse_arguments(name, arguments)?;

        match name {
            FIND_BOOKS => {
                let args: FindBooksArgs = decode(name, arguments)?;
                let by = match args.by.as_deref() {
                    None => SearchField::Title,
                    Some(raw) => raw.parse().map_err(ToolError::InvalidInput)?,
                };
                Ok(Self::FindBooks { query: args.query, by })
            }
            CREATE_ORDER => {
                let args: CreateOrderArgs = decode(name, arguments)?;
                Ok(Self::CreateOrder { customer_id: CustomerId(args.customer_id), items: args.items })
            }
            RESTOCK_BOOK => {
                let args: RestockArgs = decode(name, arguments)?;
                Ok(Self::RestockBook { isbn: Isbn(args.isbn), quantity: args.qty })
            }
            UPDATE_PRICE => {
                let args: UpdatePriceArgs = decode(name, arguments)?;
                Ok(Self::UpdatePrice { isbn: Isbn(args.isbn), price: args.price })
            }
            ORDER_STATUS => {
                let args: OrderStatusArgs = decode(name, arguments)?;
                Ok(Self::OrderStatus { order_id: OrderId(args.order_id) })
            }
            INVENTORY_SUMMARY => Ok(Self::InventorySummary),
            other => Err(ToolError::InvalidInput(format!(
                "Unknown tool `{other}`. Available tools: {}",
                tool_names().join(", ")
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::FindBooks { .. } => FIND_BOOKS,
            Self::CreateOrder { .. } => CREATE_ORDER,
            Self::RestockBook { .. } => RESTOCK_BOOK,
            Self::UpdatePrice { .. } => UPDATE_PRICE,
            Self::OrderStatus { .. } => ORDER_STATUS,
            Self::InventorySummary => INVENTORY_SUMMARY,
        }
    }
}

fn parse_arguments(name: &str, raw: &str) -> Result<Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|error| {
        ToolError::InvalidInput(format!("Arguments for `{name}` are not valid JSON: {error}"))
    })
}

fn decode<T: DeserializeOwned>(name: &str, arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|error| {
        ToolError::InvalidInput(format!("Invalid arguments for `{name}`: {error}"))
    })
}

pub fn tool_names() -> Vec<&'static str> {
    tool_schemas().iter().map(|schema| schema.name).collect()
}

pub fn tool_schemas() -> Vec<ToolSchema> {
    vec![
        ToolSchema {
            name: FIND_BOOKS,
            description: "Search the catalog by title or author. Matching is case-insensitive and \
                          finds partial words.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Text to look for" },
                    "by": {
                        "type": "string",
                        "enum": ["title", "author"],
                        "description": "Field to search, defaults to title"
                    }
                },
                "required": ["query"]
            }),
        },
        ToolSchema {
            name: CREATE_ORDER,
            description: "Place an order for a customer. Every item needs an ISBN and a positive \
                          quantity; stock is reduced when the order succeeds.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "customer_id": { "type": "integer", "description": "Customer ID" },
                    "items": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "properties": {
                                "isbn": { "type": "string" },
                                "qty": { "type": "integer", "minimum": 1 }
                            },
                            "required": ["isbn", "qty"]
                        }
                    }
                },
                "required": ["customer_id", "items"]
            }),
        },
        ToolSchema {
            name: RESTOCK_BOOK,
            description: "Add units to a book's stock.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "isbn": { "type": "string" },
                    "qty": { "type": "integer", "minimum": 1, "description": "Units to add" }
                },
                "required": ["isbn", "qty"]
            }),
        },
        ToolSchema {
            name: UPDATE_PRICE,
            description: "Set a new price for a book.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "isbn": { "type": "string" },
                    "price": { "type": "number", "exclusiveMinimum": 0 }
                },
                "required": ["isbn", "price"]
            }),
        },
        ToolSchema {
            name: ORDER_STATUS,
            description: "Show an order with its customer, items and total.",
            parameters: json!({
                "type": "object",
                "properties": { "order_id": { "type": "integer" } },
                "required": ["order_id"]
            }),
        },
        ToolSchema {
            name: INVENTORY_SUMMARY,
            description: "List books whose stock is below 10 units, scarcest first.",
            parameters: json!({ "type": "object", "properties": {} }),
        },
    ]
}

/// Result of one model-requested invocation: the payload handed back to the model
/// and the audit record persisted with the turn.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutcome {
    pub payload: Value,
    pub record: ToolCallRecord,
}

#[derive(Clone, Debug)]
pub struct ToolExecutor {
    store: LibraryStore,
}

impl ToolExecutor {
    pub fn new(store: LibraryStore) -> Self {
        Self { store }
    }

    /// Parses and runs one invocation. Failures never escape; they become error payloads.
    pub async fn dispatch(&self, name: &str, raw_arguments: &str) -> ToolOutcome {
        let arguments = serde_json::from_str::<Value>(raw_arguments)
            .unwrap_or_else(|_| Value::String(raw_arguments.to_string()));

        let result = match ToolCall::parse(name, raw_arguments) {
            Ok(call) => self.execute(&call).await,
            Err(error) => Err(error),
        };

        let (payload, succeeded) = match result {
            Ok(payload) => {
                info!(event_name = "agent.tool.completed", tool = name, "tool call succeeded");
                (payload, true)
            }
            Err(error) => {
                warn!(
                    event_name = "agent.tool.failed",
                    tool = name,
                    kind = error.kind(),
                    error = %error,
                    "tool call failed"
                );
                (error.to_payload(), false)
            }
        };

        ToolOutcome {
            record: ToolCallRecord {
                tool_name: name.to_string(),
                arguments,
                result: payload.clone(),
                succeeded,
            },
            payload,
        }
    }

    pub async fn execute(&self, call: &ToolCall) -> Result<Value, ToolError> {
        match call {
            ToolCall::FindBooks { query, by } => self.find_books(query, *by).await,
            ToolCall::CreateOrder { customer_id, items } => {
                self.create_order(*customer_id, items).await
            }
            ToolCall::RestockBook { isbn, quantity } => self.restock_book(isbn, *quantity).await,
            ToolCall::UpdatePrice { isbn, price } => self.update_price(isbn, *price).await,
            ToolCall::OrderStatus { order_id } => self.order_status(*order_id).await,
            ToolCall::InventorySummary => self.inventory_summary().await,
        }
    }

    async fn find_books(&self, query: &str, by: SearchField) -> Result<Value, ToolError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ToolError::InvalidInput("Search query must not be empty".to_string()));
        }

        let books = self.store.books().search(query, by).await?;
        let message = if books.is_empty() {
            format!("No books found matching '{query}' by {by}")
        } else {
            format!("Found {} book(s)", books.len())
        };

        Ok(json!({
            "success": true,
            "message": message,
            "count": books.len(),
            "books": books.iter().map(book_json).collect::<Vec<_>>(),
        }))
    }

    async fn create_order(
        &self,
        customer_id: CustomerId,
        items: &[NewOrderLine],
    ) -> Result<Value, ToolError> {
        let receipt = self.store.orders().create(customer_id, items).await?;
        let total = receipt.total()?;
        info!(
            event_name = "agent.order.created",
            order_id = receipt.order_id.0,
            customer_id = customer_id.0,
            lines = receipt.items.len(),
            "order created"
        );

        Ok(json!({
            "success": true,
            "message": "Order created successfully",
            "order_id": receipt.order_id.0,
            "customer_id": receipt.customer.id.0,
            "customer_name": receipt.customer.name,
            "items": receipt.items.iter().map(|line| json!({
                "isbn": line.isbn.as_str(),
                "title": line.title,
                "quantity": line.quantity_ordered,
                "price": money(line.price_at_purchase),
                "new_stock": line.new_stock,
            })).collect::<Vec<_>>(),
            "total": money(total),
        }))
    }

    async fn restock_book(&self, isbn: &Isbn, quantity: i64) -> Result<Value, ToolError> {
        if quantity <= 0 {
            return Err(ToolError::InvalidInput("Quantity must be positive".to_string()));
        }

        let book = self.require_book(isbn).await?;
        let change =
            self.store.books().restock(isbn, quantity).await?.ok_or_else(|| book_not_found(isbn))?;

        Ok(json!({
            "success": true,
            "message": "Book restocked successfully",
            "isbn": isbn.as_str(),
            "title": book.title,
            "old_stock": change.old_stock,
            "added": quantity,
            "new_stock": change.new_stock,
        }))
    }

    async fn update_price(&self, isbn: &Isbn, price: Decimal) -> Result<Value, ToolError> {
        let price = round_money(price);
        if price <= Decimal::ZERO {
            return Err(ToolError::InvalidInput("Price must be positive".to_string()));
        }

        let book = self.require_book(isbn).await?;
        let change =
            self.store.books().update_price(isbn, price).await?.ok_or_else(|| book_not_found(isbn))?;

        Ok(json!({
            "success": true,
            "message": "Price updated successfully",
            "isbn": isbn.as_str(),
            "title": book.title,
            "old_price": money(change.old_price),
            "new_price": money(change.new_price),
        }))
    }

    async fn order_status(&self, order_id: OrderId) -> Result<Value, ToolError> {
        let details = self
            .store
            .orders()
            .find_details(order_id)
            .await?
            .ok_or_else(|| ToolError::NotFound(format!("Order ID {order_id} not found")))?;
        let total = details.total()?;
        let items = details
            .items
            .iter()
            .map(|item| {
                Ok(json!({
                    "isbn": item.isbn.as_str(),
                    "title": item.title,
                    "author": item.author,
                    "quantity": item.quantity,
                    "price_at_purchase": money(item.price_at_purchase),
                    "line_total": money(item.line_total()?),
                }))
            })
            .collect::<Result<Vec<_>, ToolError>>()?;

        Ok(json!({
            "success": true,
            "order_id": details.id.0,
            "status": details.status.as_str(),
            "created_at": details.created_at.to_rfc3339(),
            "customer": {
                "id": details.customer.id.0,
                "name": details.customer.name,
                "email": details.customer.email,
            },
            "items": items,
            "total": money(total),
        }))
    }

    async fn inventory_summary(&self) -> Result<Value, ToolError> {
        let books = self.store.books().below_stock(LOW_STOCK_THRESHOLD).await?;
        let message = if books.is_empty() {
            "All books are well-stocked".to_string()
        } else {
            format!("Found {} book(s) with low stock (< {LOW_STOCK_THRESHOLD})", books.len())
        };

        Ok(json!({
            "success": true,
            "message": message,
            "threshold": LOW_STOCK_THRESHOLD,
            "count": books.len(),
            "books": books.iter().map(book_json).collect::<Vec<_>>(),
        }))
    }

    async fn require_book(&self, isbn: &Isbn) -> Result<Book, ToolError> {
        self.store.books().find_by_isbn(isbn).await?.ok_or_else(|| book_not_found(isbn))
    }
}

fn book_not_found(isbn: &Isbn) -> ToolError {
    ToolError::NotFound(format!("Book with ISBN {isbn} not found"))
}

fn book_json(book: &Book) -> Value {
    json!({
        "isbn": book.isbn.as_str(),
        "title": book.title,
        "author": book.author,
        "price": money(book.price),
        "stock": book.stock,
    })
}

fn money(amount: Decimal) -> String {
    format!("{:.2}", round_money(amount))
}
