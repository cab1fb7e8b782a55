use schemars::JsonSchema;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Transaction type as printed on the statement.
///
/// The schema published to the structuring service is closed over the six
/// canonical values. Anything else the model returns is absorbed into
/// `Unrecognized` at the deserialization boundary (with the raw string kept
/// for downstream pattern matching) instead of failing the whole statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryType {
    Credit,
    Debit,
    Transfer,
    Fee,
    Interest,
    Payment,
    Unrecognized(String),
}

impl EntryType {
    pub const CANONICAL: [&'static str; 6] =
        ["credit", "debit", "transfer", "fee", "interest", "payment"];

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "credit" => EntryType::Credit,
            "debit" => EntryType::Debit,
            "transfer" => EntryType::Transfer,
            "fee" => EntryType::Fee,
            "interest" => EntryType::Interest,
            "payment" => EntryType::Payment,
            _ => EntryType::Unrecognized(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EntryType::Credit => "credit",
            EntryType::Debit => "debit",
            EntryType::Transfer => "transfer",
            EntryType::Fee => "fee",
            EntryType::Interest => "interest",
            EntryType::Payment => "payment",
            EntryType::Unrecognized(raw) => raw,
        }
    }
}

impl Serialize for EntryType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntryType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(EntryType::parse(&raw))
    }
}

impl JsonSchema for EntryType {
    fn schema_name() -> String {
        "TransactionType".to_string()
    }

    fn json_schema(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        let mut schema = schemars::schema::SchemaObject {
            instance_type: Some(schemars::schema::InstanceType::String.into()),
            enum_values: Some(
                Self::CANONICAL
                    .iter()
                    .map(|value| Value::String((*value).to_string()))
                    .collect(),
            ),
            ..Default::default()
        };
        schema.metadata().description = Some(
            "The transaction type as printed on the statement. Use 'credit' for money \
             received, 'debit' for money spent, 'fee' for bank charges, 'interest' for \
             interest earned, 'payment' for payments whose direction is unclear, and \
             'transfer' for transfers between accounts."
                .to_string(),
        );
        schemars::schema::Schema::Object(schema)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BalanceSource {
    #[schemars(
        description = "The balance was printed on the statement as an explicit closing/ending balance line"
    )]
    Explicit,

    #[schemars(
        description = "The balance was not printed and had to be inferred from the transaction history or a running balance column"
    )]
    Inferred,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClosingBalance {
    #[schemars(
        description = "The account balance at the end of the statement period. Negative for overdrawn accounts."
    )]
    pub amount: f64,

    #[schemars(description = "Whether the balance was printed explicitly or inferred")]
    pub source: BalanceSource,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct StatementPeriod {
    #[serde(default)]
    #[schemars(
        description = "First date covered by the statement in YYYY-MM-DD format, or null if not printed"
    )]
    pub start_date: Option<String>,

    #[serde(default)]
    #[schemars(
        description = "Last date covered by the statement in YYYY-MM-DD format, or null if not printed"
    )]
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StatementRow {
    #[schemars(description = "Transaction date in YYYY-MM-DD format")]
    pub date: String,

    #[schemars(
        description = "Transaction description exactly as printed on the statement, including merchant names and reference text"
    )]
    pub description: String,

    #[schemars(
        description = "Transaction amount. Use a negative value for money leaving the account and a positive value for money arriving, when the statement makes the direction clear."
    )]
    pub amount: f64,

    #[serde(default)]
    #[schemars(required)]
    #[schemars(description = "The transaction type, one of the listed values")]
    pub transaction_type: Option<EntryType>,

    #[serde(default)]
    #[schemars(
        description = "Bank transaction reference or identifier if printed (e.g. 'FT2025011500123'), otherwise null"
    )]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StructuredStatement {
    #[serde(default)]
    #[schemars(description = "The period this statement covers")]
    pub period: StatementPeriod,

    #[serde(default)]
    #[schemars(
        description = "The closing balance of the statement, or null if it cannot be determined"
    )]
    pub closing_balance: Option<ClosingBalance>,

    #[serde(default)]
    #[schemars(
        description = "Every transaction printed on the statement, in the order it appears. Do not invent transactions that are not in the document."
    )]
    pub transactions: Vec<StatementRow>,
}

impl StructuredStatement {
    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        let settings = schemars::gen::SchemaSettings::draft07().with(|settings| {
            // The generateContent API rejects $ref, so subschemas are inlined.
            settings.inline_subschemas = true;
        });
        settings
            .into_generator()
            .into_root_schema_for::<StructuredStatement>()
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }

    /// The schema in the shape the generateContent API accepts: no `$schema`
    /// or `title` keys, and `["T", "null"]` type unions rewritten to
    /// `"type": "T", "nullable": true`.
    pub fn response_schema() -> Result<Value> {
        let mut value = serde_json::to_value(Self::generate_json_schema())?;
        if let Some(root) = value.as_object_mut() {
            root.remove("$schema");
            root.remove("title");
        }
        rewrite_nullable(&mut value);
        Ok(value)
    }
}

fn rewrite_nullable(value: &mut Value) {
    match value {
        Value::Object(obj) => {
            let null_union = obj.get("type").and_then(Value::as_array).and_then(|types| {
                if types.len() == 2 && types.contains(&Value::String("null".to_string())) {
                    types
                        .iter()
                        .find(|t| *t != &Value::String("null".to_string()))
                        .cloned()
                } else {
                    None
                }
            });
            if let Some(concrete) = null_union {
                obj.insert("type".to_string(), concrete);
                obj.insert("nullable".to_string(), Value::Bool(true));
            }

            // Option<struct> inlines as anyOf [schema, null]; flatten it.
            let null_arm = serde_json::json!({ "type": "null" });
            let any_of_concrete = obj.get("anyOf").and_then(Value::as_array).and_then(|arms| {
                if arms.len() == 2 && arms.contains(&null_arm) {
                    arms.iter().find(|arm| **arm != null_arm).cloned()
                } else {
                    None
                }
            });
            if let Some(Value::Object(concrete)) = any_of_concrete {
                obj.remove("anyOf");
                for (key, val) in concrete {
                    obj.entry(key).or_insert(val);
                }
                obj.insert("nullable".to_string(), Value::Bool(true));
            }

            for (_, child) in obj.iter_mut() {
                rewrite_nullable(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_nullable(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_type_parse_is_lenient() {
        assert_eq!(EntryType::parse("credit"), EntryType::Credit);
        assert_eq!(EntryType::parse(" DEBIT "), EntryType::Debit);
        assert_eq!(EntryType::parse("Interest"), EntryType::Interest);
        assert_eq!(
            EntryType::parse("standing order"),
            EntryType::Unrecognized("standing order".to_string())
        );
    }

    #[test]
    fn test_entry_type_absorbs_unknown_values_on_deserialize() {
        let parsed: EntryType = serde_json::from_str("\"payment\"").unwrap();
        assert_eq!(parsed, EntryType::Payment);

        let parsed: EntryType = serde_json::from_str("\"cashback bonus\"").unwrap();
        assert_eq!(parsed, EntryType::Unrecognized("cashback bonus".to_string()));
    }

    #[test]
    fn test_published_schema_stays_closed() {
        let schema_json = StructuredStatement::schema_as_json().unwrap();
        for canonical in EntryType::CANONICAL {
            assert!(
                schema_json.contains(&format!("\"{}\"", canonical)),
                "schema should list {}",
                canonical
            );
        }
        assert!(!schema_json.contains("Unrecognized"));
        assert!(!schema_json.contains("unrecognized"));
    }

    #[test]
    fn test_response_schema_has_no_refs() {
        let schema = StructuredStatement::response_schema().unwrap();
        let rendered = schema.to_string();
        assert!(!rendered.contains("$ref"));
        assert!(!rendered.contains("$schema"));
        assert!(rendered.contains("transactions"));
        assert!(rendered.contains("closing_balance"));
    }

    #[test]
    fn test_response_schema_rewrites_null_unions() {
        let schema = StructuredStatement::response_schema().unwrap();
        let rendered = schema.to_string();
        assert!(!rendered.contains("[\"string\",\"null\"]"));
        assert!(!rendered.contains("[\"null\",\"string\"]"));
        assert!(rendered.contains("\"nullable\":true"));
    }

    #[test]
    fn test_statement_parse_tolerates_noisy_output() {
        let raw = r#"{
            "period": { "start_date": "2025-01-01", "end_date": null },
            "transactions": [
                { "date": "2025-01-15", "description": "SALARY ACME", "amount": 2500.0, "transaction_type": "credit" },
                { "date": "2025-01-16", "description": "COFFEE SHOP", "amount": -4.5, "transaction_type": "card purchase" },
                { "date": "2025-01-17", "description": "MYSTERY ROW", "amount": 10.0 }
            ]
        }"#;

        let statement: StructuredStatement = serde_json::from_str(raw).unwrap();
        assert_eq!(statement.transactions.len(), 3);
        assert!(statement.closing_balance.is_none());
        assert_eq!(
            statement.transactions[0].transaction_type,
            Some(EntryType::Credit)
        );
        assert_eq!(
            statement.transactions[1].transaction_type,
            Some(EntryType::Unrecognized("card purchase".to_string()))
        );
        assert_eq!(statement.transactions[2].transaction_type, None);
    }

    #[test]
    fn test_statement_parse_tolerates_missing_sections() {
        let statement: StructuredStatement = serde_json::from_str("{}").unwrap();
        assert!(statement.transactions.is_empty());
        assert!(statement.period.start_date.is_none());
        assert!(statement.closing_balance.is_none());
    }
}
