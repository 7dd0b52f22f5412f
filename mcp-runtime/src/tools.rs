use serde_json::{Map, Value, json};

use crate::aggregate::{self, StopReason};
use crate::client::{CONTACTS, HoldedClient, INVOICES, PRODUCTS, Resource, UpstreamError};

pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// What a registered tool does, as data. Dispatch is a match on this enum;
/// exposing another Holded resource is a `Resource` constant plus entries in
/// `tool_definitions()`, not a new handler function.
#[derive(Debug, Clone, Copy)]
pub enum ToolAction {
    /// One page of a listing; optional `page` and `perPage` arguments.
    ListPage(Resource),
    /// Aggregate every page, then shape the result under the byte limit.
    ListAll(Resource),
    /// Fetch a single record by the named id argument.
    Get(Resource, &'static str),
    /// Create a record from the argument object.
    Create(Resource),
    /// Update the record named by the id argument with the remaining fields.
    Update(Resource, &'static str),
    /// Delete a single record by the named id argument.
    Delete(Resource, &'static str),
}

#[derive(Debug)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    pub action: ToolAction,
}

/// Caller-recoverable tool failure. Rendered as an error-flagged invocation
/// result, never as a JSON-RPC protocol error.
#[derive(Debug, Clone)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    pub field: Option<String>,
    pub details: Option<Value>,
}

impl ToolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            details: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn to_value(&self) -> Value {
        let mut payload = json!({
            "error": self.code,
            "message": self.message
        });
        if let Some(field) = &self.field {
            payload["field"] = Value::String(field.clone());
        }
        if let Some(details) = &self.details {
            payload["details"] = details.clone();
        }
        payload
    }
}

impl From<UpstreamError> for ToolError {
    fn from(err: UpstreamError) -> Self {
        let code = match err.status() {
            Some(_) => "upstream_error",
            None => "connection_error",
        };
        let mut tool_err = ToolError::new(code, err.to_string());
        if let Some(status) = err.status() {
            tool_err = tool_err.with_details(json!({ "status": status }));
        }
        tool_err
    }
}

fn id_schema(id_field: &str, description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            id_field: { "type": "string", "description": description }
        },
        "required": [id_field],
        "additionalProperties": false
    })
}

fn paged_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "page": { "type": "number", "description": "Page number (default: 1)" },
            "perPage": { "type": "number", "description": "Records per page (default: 50, max recommended: 100)" }
        },
        "additionalProperties": false
    })
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "get_contacts",
            description: "Get one page of contacts from Holded.",
            input_schema: paged_schema(),
            action: ToolAction::ListPage(CONTACTS),
        },
        ToolDefinition {
            name: "get_all_contacts",
            description: "Get ALL contacts from Holded, walking every page. Large results are summarized.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "maxPerPage": { "type": "number", "description": "Page size used while walking (default: 50)" }
                },
                "additionalProperties": false
            }),
            action: ToolAction::ListAll(CONTACTS),
        },
        ToolDefinition {
            name: "get_contact",
            description: "Get a specific contact by ID.",
            input_schema: id_schema("contactId", "The contact ID"),
            action: ToolAction::Get(CONTACTS, "contactId"),
        },
        ToolDefinition {
            name: "create_contact",
            description: "Create a new contact in Holded.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Contact name" },
                    "email": { "type": "string", "description": "Contact email" },
                    "phone": { "type": "string", "description": "Contact phone" },
                    "type": { "type": "string", "description": "Contact type (client, supplier, lead, ...)" },
                    "code": { "type": "string", "description": "Tax ID / code" }
                },
                "required": ["name"],
                "additionalProperties": true
            }),
            action: ToolAction::Create(CONTACTS),
        },
        ToolDefinition {
            name: "update_contact",
            description: "Update an existing contact.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "contactId": { "type": "string", "description": "The contact ID" },
                    "name": { "type": "string" },
                    "email": { "type": "string" },
                    "phone": { "type": "string" }
                },
                "required": ["contactId"],
                "additionalProperties": true
            }),
            action: ToolAction::Update(CONTACTS, "contactId"),
        },
        ToolDefinition {
            name: "delete_contact",
            description: "Delete a contact from Holded.",
            input_schema: id_schema("contactId", "The contact ID"),
            action: ToolAction::Delete(CONTACTS, "contactId"),
        },
        ToolDefinition {
            name: "get_products",
            description: "Get one page of products from Holded.",
            input_schema: paged_schema(),
            action: ToolAction::ListPage(PRODUCTS),
        },
        ToolDefinition {
            name: "get_product",
            description: "Get a specific product by ID.",
            input_schema: id_schema("productId", "The product ID"),
            action: ToolAction::Get(PRODUCTS, "productId"),
        },
        ToolDefinition {
            name: "create_product",
            description: "Create a new product in Holded.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Product name" },
                    "desc": { "type": "string", "description": "Product description" },
                    "price": { "type": "number", "description": "Sale price" },
                    "sku": { "type": "string", "description": "Stock keeping unit" }
                },
                "required": ["name"],
                "additionalProperties": true
            }),
            action: ToolAction::Create(PRODUCTS),
        },
        ToolDefinition {
            name: "get_invoices",
            description: "Get one page of invoices from Holded.",
            input_schema: paged_schema(),
            action: ToolAction::ListPage(INVOICES),
        },
        ToolDefinition {
            name: "get_invoice",
            description: "Get a specific invoice by ID.",
            input_schema: id_schema("invoiceId", "The invoice ID"),
            action: ToolAction::Get(INVOICES, "invoiceId"),
        },
        ToolDefinition {
            name: "create_invoice",
            description: "Create a new invoice in Holded.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "contactId": { "type": "string", "description": "The contact to invoice" },
                    "items": {
                        "type": "array",
                        "description": "Invoice lines",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "units": { "type": "number" },
                                "price": { "type": "number" }
                            },
                            "required": ["name", "units", "price"]
                        }
                    },
                    "date": { "type": "string", "description": "Invoice date (YYYY-MM-DD)" },
                    "notes": { "type": "string" }
                },
                "required": ["contactId", "items"],
                "additionalProperties": true
            }),
            action: ToolAction::Create(INVOICES),
        },
    ]
}

pub fn find_tool(name: &str) -> Option<ToolDefinition> {
    tool_definitions().into_iter().find(|tool| tool.name == name)
}

/// Check the argument object against the schema's `required` list. Required
/// string arguments must also be non-empty strings.
pub fn validate_required_arguments(
    tool: &ToolDefinition,
    args: &Map<String, Value>,
) -> Result<(), ToolError> {
    let required = tool
        .input_schema
        .get("required")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for field in required.iter().filter_map(Value::as_str) {
        let Some(value) = args.get(field) else {
            return Err(ToolError::new(
                "validation_failed",
                format!("Missing required argument '{field}'"),
            )
            .with_field(field));
        };

        let declared_type = tool
            .input_schema
            .pointer(&format!("/properties/{field}/type"))
            .and_then(Value::as_str);
        if declared_type == Some("string") {
            match value.as_str() {
                Some(s) if !s.trim().is_empty() => {}
                _ => {
                    return Err(ToolError::new(
                        "validation_failed",
                        format!("Argument '{field}' must be a non-empty string"),
                    )
                    .with_field(field));
                }
            }
        }
    }
    Ok(())
}

fn optional_u32_arg(args: &Map<String, Value>, key: &str, default: u32) -> Result<u32, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .filter(|n| *n >= 1 && *n <= u64::from(u32::MAX))
            .map(|n| n as u32)
            .ok_or_else(|| {
                ToolError::new(
                    "validation_failed",
                    format!("Argument '{key}' must be a positive integer"),
                )
                .with_field(key)
            }),
    }
}

/// Execute a validated tool action against the Holded API.
pub async fn execute_action(
    client: &HoldedClient,
    action: ToolAction,
    args: &Map<String, Value>,
    default_page_size: u32,
    max_pages: u32,
    response_byte_limit: usize,
) -> Result<Value, ToolError> {
    match action {
        ToolAction::ListPage(resource) => {
            let page = optional_u32_arg(args, "page", 1)?;
            let per_page = optional_u32_arg(args, "perPage", default_page_size)?;
            let records = client.fetch_page(resource, page, per_page).await?;
            let mut envelope = Map::new();
            envelope.insert("page".to_string(), json!(page));
            envelope.insert("count".to_string(), json!(records.len()));
            envelope.insert(resource.name.to_string(), Value::Array(records));
            Ok(Value::Object(envelope))
        }
        ToolAction::ListAll(resource) => {
            let per_page = optional_u32_arg(args, "maxPerPage", default_page_size)?;
            let aggregation = aggregate::fetch_all(
                |page| client.fetch_page(resource, page, per_page),
                per_page,
                max_pages,
            )
            .await;

            let partial = aggregation.stop == StopReason::Upstream;
            let pages_fetched = aggregation.pages_fetched;
            let stop = aggregation.stop;
            let mut shaped =
                aggregate::shape_contact_collection(aggregation.records, response_byte_limit);
            if partial {
                // Listing arrays cannot carry metadata; wrap only when partial.
                if shaped.is_array() {
                    let mut wrapped = Map::new();
                    wrapped.insert("partial".to_string(), Value::Bool(true));
                    wrapped.insert(resource.name.to_string(), shaped);
                    shaped = Value::Object(wrapped);
                } else {
                    shaped["partial"] = Value::Bool(true);
                }
                tracing::warn!(
                    event = "list_all_partial",
                    resource = resource.name,
                    pages_fetched,
                    stop = stop.as_str(),
                    "returning partially aggregated collection"
                );
            }
            Ok(shaped)
        }
        ToolAction::Get(resource, id_field) => {
            let id = required_id(args, id_field)?;
            Ok(client.fetch_one(resource, id).await?)
        }
        ToolAction::Create(resource) => {
            let payload = Value::Object(args.clone());
            Ok(client.create(resource, &payload).await?)
        }
        ToolAction::Update(resource, id_field) => {
            let id = required_id(args, id_field)?.to_string();
            let mut payload = args.clone();
            payload.remove(id_field);
            Ok(client
                .update(resource, &id, &Value::Object(payload))
                .await?)
        }
        ToolAction::Delete(resource, id_field) => {
            let id = required_id(args, id_field)?;
            Ok(client.delete(resource, id).await?)
        }
    }
}

fn required_id<'a>(args: &'a Map<String, Value>, id_field: &str) -> Result<&'a str, ToolError> {
    args.get(id_field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            ToolError::new(
                "validation_failed",
                format!("Missing required argument '{id_field}'"),
            )
            .with_field(id_field)
        })
}
