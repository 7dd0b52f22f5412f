use serde_json::{Value, json};

use crate::client::UpstreamError;

/// Why a full-collection walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A page came back empty.
    EmptyPage,
    /// A page came back shorter than the page size, so it was the last one.
    ShortPage,
    /// The page cap was hit before the upstream ran out of records.
    PageLimit,
    /// The upstream failed mid-walk; accumulated records are kept.
    Upstream,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::EmptyPage => "empty_page",
            StopReason::ShortPage => "short_page",
            StopReason::PageLimit => "page_limit",
            StopReason::Upstream => "upstream_error",
        }
    }
}

#[derive(Debug)]
pub struct Aggregation {
    pub records: Vec<Value>,
    pub pages_fetched: u32,
    pub stop: StopReason,
}

/// Walk a paginated listing from page 1 until the collection is exhausted.
///
/// A short page already proves there is nothing after it, so no trailing
/// empty-page request is made. An upstream failure ends the walk with whatever
/// was accumulated so far; partial data beats none for a read-only listing.
pub async fn fetch_all<F, Fut>(mut fetch: F, per_page: u32, max_pages: u32) -> Aggregation
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<Value>, UpstreamError>>,
{
    let mut records: Vec<Value> = Vec::new();
    let mut pages_fetched: u32 = 0;

    loop {
        if pages_fetched >= max_pages {
            return Aggregation {
                records,
                pages_fetched,
                stop: StopReason::PageLimit,
            };
        }

        let page = pages_fetched + 1;
        match fetch(page).await {
            Ok(batch) => {
                pages_fetched += 1;
                let count = batch.len();
                records.extend(batch);
                if count == 0 {
                    return Aggregation {
                        records,
                        pages_fetched,
                        stop: StopReason::EmptyPage,
                    };
                }
                if (count as u32) < per_page {
                    return Aggregation {
                        records,
                        pages_fetched,
                        stop: StopReason::ShortPage,
                    };
                }
            }
            Err(err) => {
                tracing::warn!(
                    event = "aggregation_partial_stop",
                    page,
                    records_so_far = records.len(),
                    error = %err,
                    "upstream failed mid-walk, returning partial collection"
                );
                return Aggregation {
                    records,
                    pages_fetched,
                    stop: StopReason::Upstream,
                };
            }
        }
    }
}

/// Shape an aggregated contact collection for the tool envelope. Under the
/// byte limit the full record set passes through untouched; over it, each
/// contact collapses to the id/name/code/email/type projection and the
/// envelope says so.
pub fn shape_contact_collection(records: Vec<Value>, byte_limit: usize) -> Value {
    let full = Value::Array(records);
    if serialized_json_size_bytes(&full) <= byte_limit {
        return full;
    }

    let Value::Array(records) = full else {
        unreachable!()
    };
    let total = records.len();
    let summaries: Vec<Value> = records.iter().map(summarize_contact).collect();
    json!({
        "totalContacts": total,
        "truncated": true,
        "message": "Response truncated due to size. Showing summary with id, name, code, email, type only.",
        "contacts": summaries,
    })
}

fn summarize_contact(contact: &Value) -> Value {
    let mut summary = serde_json::Map::new();
    for key in ["id", "name", "code", "email", "type"] {
        if let Some(value) = contact.get(key) {
            summary.insert(key.to_string(), value.clone());
        }
    }
    Value::Object(summary)
}

fn serialized_json_size_bytes(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}
