//! Static catalog of backend operations offered to the model.
//!
//! The catalog is a closed set: [`Operation`] enumerates every operation and
//! [`Operation::spec`] is the exhaustive table mapping each one to its
//! description and parameter schema. Adding an operation means adding a
//! variant, a name, and a spec entry; [`check_dispatch`] verifies the three
//! agree at startup.

use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

/// Bumped whenever an operation or schema changes.
pub const CATALOG_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListProducts,
    GetProduct,
    SearchProducts,
    GetCustomer,
    VerifyCustomerPin,
    ListOrders,
    GetOrder,
    CreateOrder,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Self::ListProducts,
        Self::GetProduct,
        Self::SearchProducts,
        Self::GetCustomer,
        Self::VerifyCustomerPin,
        Self::ListOrders,
        Self::GetOrder,
        Self::CreateOrder,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::ListProducts => "list_products",
            Self::GetProduct => "get_product",
            Self::SearchProducts => "search_products",
            Self::GetCustomer => "get_customer",
            Self::VerifyCustomerPin => "verify_customer_pin",
            Self::ListOrders => "list_orders",
            Self::GetOrder => "get_order",
            Self::CreateOrder => "create_order",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    /// The operation whose success establishes a verified customer.
    pub fn is_verification(self) -> bool {
        matches!(self, Self::VerifyCustomerPin)
    }

    /// Safe to resend when the first attempt's fate is unknown.
    pub fn is_idempotent(self) -> bool {
        !matches!(self, Self::CreateOrder)
    }

    fn spec(self) -> OperationSpec {
        use ParamKind::*;

        let (description, params) = match self {
            Self::ListProducts => (
                "List products with optional filters. Use this to browse inventory by \
                 category or check stock levels.",
                vec![
                    Param::optional(
                        "category",
                        "Filter by category (e.g., 'Computers', 'Monitors', 'Printers', \
                         'Accessories', 'Networking')",
                        String,
                    ),
                    Param::optional("is_active", "Filter by active status (true/false)", Boolean),
                ],
            ),
            Self::GetProduct => (
                "Get detailed product information by SKU. Use this to get current price, \
                 check inventory for a specific item, or verify product details.",
                vec![Param::required(
                    "sku",
                    "Product SKU (e.g., 'COM-0001', 'MON-0054')",
                    String,
                )],
            ),
            Self::SearchProducts => (
                "Search products by name or description. Use this for natural language \
                 product lookup.",
                vec![Param::required(
                    "query",
                    "Search term (case-insensitive, partial match)",
                    String,
                )],
            ),
            Self::GetCustomer => (
                "Get customer information by ID. Use this to look up customer details or \
                 verify a shipping address.",
                vec![Param::required("customer_id", "Customer UUID", String)],
            ),
            Self::VerifyCustomerPin => (
                "Verify customer identity with email and PIN. Use this to authenticate the \
                 customer before accessing their account or placing orders.",
                vec![
                    Param::required("email", "Customer email address", String),
                    Param::required("pin", "4-digit PIN code", String),
                ],
            ),
            Self::ListOrders => (
                "List orders with optional filters. Use this to view customer order history \
                 or track pending orders.",
                vec![
                    Param::optional("customer_id", "Filter by customer UUID", String),
                    Param::optional(
                        "status",
                        "Filter by order status",
                        Enum(&["draft", "submitted", "approved", "fulfilled", "cancelled"]),
                    ),
                ],
            ),
            Self::GetOrder => (
                "Get detailed order information including items. Use this to view order \
                 details or check order contents.",
                vec![Param::required("order_id", "Order UUID", String)],
            ),
            Self::CreateOrder => (
                "Create a new order with items. The customer must be verified first. The \
                 order starts in 'submitted' status.",
                vec![
                    Param::required(
                        "customer_id",
                        "Customer UUID (must be verified first)",
                        String,
                    ),
                    Param::required(
                        "items",
                        "List of items to order",
                        Array(Box::new(Object(vec![
                            Param::required("sku", "Product SKU", String),
                            Param::required("quantity", "Quantity (must be > 0)", Integer),
                            Param::required("unit_price", "Price as a decimal string", String),
                            Param::optional("currency", "Currency code (default: USD)", String),
                        ]))),
                    ),
                ],
            ),
        };

        OperationSpec {
            operation: self,
            description,
            params,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    /// A string restricted to the listed values.
    Enum(&'static [&'static str]),
    Array(Box<ParamKind>),
    Object(Vec<Param>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

impl Param {
    fn required(name: &'static str, description: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            description,
            kind,
            required: true,
        }
    }

    fn optional(name: &'static str, description: &'static str, kind: ParamKind) -> Self {
        Self {
            required: false,
            ..Self::required(name, description, kind)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationSpec {
    pub operation: Operation,
    pub description: &'static str,
    pub params: Vec<Param>,
}

/// Which flavour of schema a model API expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaDialect {
    /// Plain JSON Schema (OpenAI, Anthropic).
    JsonSchema,
    /// Gemini's OpenAPI subset with upper-case type names.
    Gemini,
}

/// Rejection of a tool call before it reaches the network.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
    #[error("arguments must be a JSON object")]
    NotAnObject,
    #[error("missing required argument '{0}'")]
    Missing(String),
    #[error("argument '{field}' must be {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },
    #[error("argument '{field}' must be one of {allowed:?}, got '{value}'")]
    NotAllowed {
        field: String,
        value: String,
        allowed: &'static [&'static str],
    },
}

static CATALOG: LazyLock<Vec<OperationSpec>> =
    LazyLock::new(|| Operation::ALL.into_iter().map(Operation::spec).collect());

/// Every operation offered to the model, in a stable order.
pub fn list_operations() -> &'static [OperationSpec] {
    &CATALOG
}

pub fn lookup(name: &str) -> Option<&'static OperationSpec> {
    CATALOG.iter().find(|spec| spec.name() == name)
}

/// Resolve a requested call against the catalog and validate its arguments.
///
/// Returns the operation schema plus the normalized arguments to send.
pub fn resolve(
    name: &str,
    arguments: &Value,
) -> Result<(&'static OperationSpec, Value), ValidationError> {
    let spec = lookup(name).ok_or_else(|| ValidationError::UnknownOperation(name.to_string()))?;
    let normalized = spec.validate(arguments)?;
    Ok((spec, normalized))
}

/// Startup check that the enum, its names and the schema table agree.
pub fn check_dispatch() -> Result<(), String> {
    if CATALOG.len() != Operation::ALL.len() {
        return Err(format!(
            "catalog has {} entries but {} operations are declared",
            CATALOG.len(),
            Operation::ALL.len()
        ));
    }
    for (i, spec) in CATALOG.iter().enumerate() {
        if Operation::from_name(spec.name()) != Some(spec.operation) {
            return Err(format!("operation '{}' does not round-trip by name", spec.name()));
        }
        if CATALOG[..i].iter().any(|other| other.name() == spec.name()) {
            return Err(format!("duplicate operation name '{}'", spec.name()));
        }
    }
    Ok(())
}

impl OperationSpec {
    pub fn name(&self) -> &'static str {
        self.operation.name()
    }

    /// Parameter schema for the top-level arguments object.
    pub fn parameter_schema(&self, dialect: SchemaDialect) -> Value {
        object_schema(&self.params, None, dialect)
    }

    /// Check `arguments` against the schema and return a normalized copy.
    ///
    /// Integral floats (`2.0`, as some models emit) become integers; optional
    /// arguments passed as `null` are dropped.
    pub fn validate(&self, arguments: &Value) -> Result<Value, ValidationError> {
        match arguments {
            Value::Null => validate_object(&self.params, &Map::new(), ""),
            Value::Object(map) => validate_object(&self.params, map, ""),
            _ => Err(ValidationError::NotAnObject),
        }
    }
}

fn type_name(kind: &ParamKind, dialect: SchemaDialect) -> &'static str {
    let lower = match kind {
        ParamKind::String | ParamKind::Enum(_) => "string",
        ParamKind::Integer => "integer",
        ParamKind::Number => "number",
        ParamKind::Boolean => "boolean",
        ParamKind::Array(_) => "array",
        ParamKind::Object(_) => "object",
    };
    match dialect {
        SchemaDialect::JsonSchema => lower,
        SchemaDialect::Gemini => match lower {
            "string" => "STRING",
            "integer" => "INTEGER",
            "number" => "NUMBER",
            "boolean" => "BOOLEAN",
            "array" => "ARRAY",
            _ => "OBJECT",
        },
    }
}

fn kind_schema(kind: &ParamKind, description: Option<&str>, dialect: SchemaDialect) -> Value {
    if let ParamKind::Object(fields) = kind {
        return object_schema(fields, description, dialect);
    }

    let mut schema = Map::new();
    schema.insert("type".into(), json!(type_name(kind, dialect)));
    if let Some(desc) = description {
        schema.insert("description".into(), json!(desc));
    }
    match kind {
        ParamKind::Enum(values) => {
            if dialect == SchemaDialect::Gemini {
                schema.insert("format".into(), json!("enum"));
            }
            schema.insert("enum".into(), json!(values));
        }
        ParamKind::Array(items) => {
            schema.insert("items".into(), kind_schema(items, None, dialect));
        }
        _ => {}
    }
    Value::Object(schema)
}

fn object_schema(fields: &[Param], description: Option<&str>, dialect: SchemaDialect) -> Value {
    let properties: Map<String, Value> = fields
        .iter()
        .map(|p| {
            (
                p.name.to_string(),
                kind_schema(&p.kind, Some(p.description), dialect),
            )
        })
        .collect();
    let required: Vec<&str> = fields.iter().filter(|p| p.required).map(|p| p.name).collect();

    let mut schema = Map::new();
    schema.insert("type".into(), json!(type_name(&ParamKind::Object(vec![]), dialect)));
    if let Some(desc) = description {
        schema.insert("description".into(), json!(desc));
    }
    schema.insert("properties".into(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".into(), json!(required));
    }
    Value::Object(schema)
}

fn field_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn validate_object(
    fields: &[Param],
    map: &Map<String, Value>,
    prefix: &str,
) -> Result<Value, ValidationError> {
    let mut out = Map::new();
    for param in fields {
        let path = field_path(prefix, param.name);
        match map.get(param.name) {
            None | Some(Value::Null) if param.required => {
                return Err(ValidationError::Missing(path));
            }
            None | Some(Value::Null) => {}
            Some(value) => {
                out.insert(param.name.to_string(), validate_value(&param.kind, value, &path)?);
            }
        }
    }
    // Keep anything the schema does not mention; the backend decides.
    for (key, value) in map {
        if !out.contains_key(key) && !value.is_null() {
            out.insert(key.clone(), value.clone());
        }
    }
    Ok(Value::Object(out))
}

fn validate_value(kind: &ParamKind, value: &Value, path: &str) -> Result<Value, ValidationError> {
    let wrong = |expected| ValidationError::WrongType {
        field: path.to_string(),
        expected,
    };
    match kind {
        ParamKind::String => value
            .as_str()
            .map(|_| value.clone())
            .ok_or_else(|| wrong("a string")),
        ParamKind::Boolean => value
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| wrong("a boolean")),
        ParamKind::Number => {
            if value.is_number() {
                Ok(value.clone())
            } else {
                Err(wrong("a number"))
            }
        }
        ParamKind::Integer => {
            if value.is_i64() || value.is_u64() {
                Ok(value.clone())
            } else {
                match value.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(json!(f as i64)),
                    _ => Err(wrong("an integer")),
                }
            }
        }
        ParamKind::Enum(allowed) => {
            let s = value.as_str().ok_or_else(|| wrong("a string"))?;
            if allowed.iter().any(|a| *a == s) {
                Ok(value.clone())
            } else {
                Err(ValidationError::NotAllowed {
                    field: path.to_string(),
                    value: s.to_string(),
                    allowed: *allowed,
                })
            }
        }
        ParamKind::Array(items) => {
            let arr = value.as_array().ok_or_else(|| wrong("an array"))?;
            arr.iter()
                .enumerate()
                .map(|(i, v)| validate_value(items, v, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        ParamKind::Object(fields) => {
            let map = value.as_object().ok_or_else(|| wrong("an object"))?;
            validate_object(fields, map, path)
        }
    }
}
