//! System instructions, rebuilt for every model call.

use crate::catalog::OperationSpec;
use crate::config::AssistantConfig;
use crate::session::CustomerContext;
use serde_json::Value;

pub fn build_system_prompt(
    assistant: &AssistantConfig,
    tools: &[OperationSpec],
    customer: Option<&CustomerContext>,
) -> String {
    let company = &assistant.company_name;
    let categories = assistant
        .product_categories
        .iter()
        .map(|c| {
            if c.examples.is_empty() {
                format!("- {}", c.name)
            } else {
                format!("- {} ({})", c.name, c.examples)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    let tool_descriptions = tools
        .iter()
        .map(|t| format!("- **{}**: {}", t.name(), t.description))
        .collect::<Vec<_>>()
        .join("\n");
    let customer_section = customer.map(customer_section).unwrap_or_default();

    format!(
        r#"You are a helpful and friendly customer support agent for {company}, a company that sells computer products.

## Your Capabilities

1. Help customers browse and search for products
2. Provide detailed product information and pricing
3. Verify customer identity using their email and PIN
4. View customer order history
5. Help customers place new orders (only after verification)

You have access to the following tools:
{tool_descriptions}

## Guidelines

- Be friendly, professional, and concise
- Always verify customer identity (email + PIN) before accessing their account or placing orders
- Provide clear pricing information in USD
- If a tool reports an error, explain it plainly and suggest what the customer can do
- If a search returns nothing, say so; never invent products, prices, or orders

## Product Categories

{categories}
{customer_section}
## Using Tools

- Use search_products for natural language queries
- Use list_products with a category filter for browsing
- Use get_product for specific SKU details
- For orders, include sku, quantity, unit_price (as a string) and currency (USD)"#
    )
}

fn customer_section(customer: &CustomerContext) -> String {
    let mut lines = vec!["\n## Verified Customer\n".to_string()];
    if let Some(id) = &customer.customer_id {
        lines.push(format!("- Customer ID: {id}"));
    }
    if let Some(name) = &customer.name {
        lines.push(format!("- Name: {name}"));
    }
    if let Some(email) = &customer.email {
        lines.push(format!("- Email: {email}"));
    }
    match &customer.profile {
        Value::String(text) if !text.trim().is_empty() => {
            lines.push(format!("\nBackend record:\n{}", text.trim()));
        }
        Value::Object(map) if !map.is_empty() => {
            lines.push(format!("\nBackend record: {}", customer.profile));
        }
        _ => {}
    }
    lines.push(
        "\nThe customer has been verified and can view their orders and place new ones.\n"
            .to_string(),
    );
    lines.join("\n")
}
