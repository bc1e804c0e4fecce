//! Request types and structural fingerprinting.
//!
//! A [`QueryRequest`] is identified by its [`Fingerprint`], a digest of its
//! structure in which every array is treated as an unordered multiset and
//! object keys are sorted. Two requests with the same filters listed in a
//! different order therefore share a fingerprint, and therefore a cache slot.
//!
//! # Example
//!
//! ```
//! use store_query::request::QueryRequest;
//!
//! let a = QueryRequest::new("books").with_filters_applied(["fiction", "recent"]);
//! let b = QueryRequest::new("books").with_filters_applied(["recent", "fiction"]);
//!
//! assert_eq!(a.fingerprint(), b.fingerprint());
//! ```

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Identifier of a store in the underlying document store.
pub type StoreId = String;

/// Identifier of a filter within a request's filter configuration.
pub type FilterId = String;

/// Comparison performed by a [`FilterOperator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Equals,
    Contains,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Operator {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::Contains => "contains",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
        }
    }
}

/// A single predicate over one indexed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterOperator {
    pub id: FilterId,
    pub field: String,
    pub operator: Operator,
    pub operand: Value,
}

impl FilterOperator {
    pub fn new(
        id: impl Into<FilterId>,
        field: impl Into<String>,
        operator: Operator,
        operand: impl Into<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            field: field.into(),
            operator,
            operand: operand.into(),
        }
    }

    fn canonical(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".into(), Value::String(self.id.clone()));
        map.insert("field".into(), Value::String(self.field.clone()));
        map.insert("operator".into(), Value::String(self.operator.as_str().into()));
        map.insert("operand".into(), self.operand.clone());
        Value::Object(map)
    }
}

/// Groups of filter predicates. Filters within a group are alternatives; groups
/// are combined.
pub type FilterConfig = Vec<Vec<FilterOperator>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    Asc,
    Desc,
}

/// A filtered query against one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub store_id: StoreId,
    pub filter_config: FilterConfig,
    pub filters_applied: Vec<FilterId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_direction: Option<OrderDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_page: Option<usize>,
}

impl QueryRequest {
    /// Creates an unfiltered request for the given store.
    pub fn new(store_id: impl Into<StoreId>) -> Self {
        Self {
            store_id: store_id.into(),
            filter_config: Vec::new(),
            filters_applied: Vec::new(),
            order_by: None,
            order_direction: None,
            page: None,
            per_page: None,
        }
    }

    #[must_use]
    pub fn with_filter_config(mut self, filter_config: FilterConfig) -> Self {
        self.filter_config = filter_config;
        self
    }

    #[must_use]
    pub fn with_filters_applied<I, F>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<FilterId>,
    {
        self.filters_applied = filters.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_order(mut self, field: impl Into<String>, direction: OrderDirection) -> Self {
        self.order_by = Some(field.into());
        self.order_direction = Some(direction);
        self
    }

    #[must_use]
    pub const fn with_page(mut self, page: usize, per_page: usize) -> Self {
        self.page = Some(page);
        self.per_page = Some(per_page);
        self
    }

    /// Computes the structural fingerprint of this request.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.canonical())
    }

    /// Returns `true` if both requests select with the same filter configuration
    /// and the same applied filters, ignoring order.
    #[must_use]
    pub fn has_same_filters(&self, other: &Self) -> bool {
        digest(&filter_config_canonical(&self.filter_config))
            == digest(&filter_config_canonical(&other.filter_config))
            && digest(&strings_canonical(&self.filters_applied))
                == digest(&strings_canonical(&other.filters_applied))
    }

    fn canonical(&self) -> Value {
        let mut map = Map::new();
        map.insert("storeId".into(), Value::String(self.store_id.clone()));
        map.insert(
            "filterConfig".into(),
            filter_config_canonical(&self.filter_config),
        );
        map.insert(
            "filtersApplied".into(),
            strings_canonical(&self.filters_applied),
        );
        if let Some(order_by) = &self.order_by {
            map.insert("orderBy".into(), Value::String(order_by.clone()));
        }
        if let Some(direction) = self.order_direction {
            let direction = match direction {
                OrderDirection::Asc => "asc",
                OrderDirection::Desc => "desc",
            };
            map.insert("orderDirection".into(), Value::String(direction.into()));
        }
        if let Some(page) = self.page {
            map.insert("page".into(), Value::from(page));
        }
        if let Some(per_page) = self.per_page {
            map.insert("perPage".into(), Value::from(per_page));
        }
        Value::Object(map)
    }
}

/// Returns `true` if both requests have the same fingerprint.
#[must_use]
pub fn are_requests_equal(a: &QueryRequest, b: &QueryRequest) -> bool {
    a.fingerprint() == b.fingerprint()
}

/// Reads every value stored under one index of a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexValuesRequest {
    pub store_id: StoreId,
    pub field: String,
}

impl IndexValuesRequest {
    pub fn new(store_id: impl Into<StoreId>, field: impl Into<String>) -> Self {
        Self {
            store_id: store_id.into(),
            field: field.into(),
        }
    }
}

/// Creates a store with the given indexed fields and primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStoreRequest {
    pub store_id: StoreId,
    pub index_config: Vec<String>,
    pub key_path: String,
}

impl CreateStoreRequest {
    pub fn new<I, F>(store_id: impl Into<StoreId>, index_config: I, key_path: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<String>,
    {
        Self {
            store_id: store_id.into(),
            index_config: index_config.into_iter().map(Into::into).collect(),
            key_path: key_path.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteStoreRequest {
    pub store_id: StoreId,
}

impl DeleteStoreRequest {
    pub fn new(store_id: impl Into<StoreId>) -> Self {
        Self {
            store_id: store_id.into(),
        }
    }
}

/// Inserts documents into an existing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddDocumentsRequest<D> {
    pub store_id: StoreId,
    pub documents: Vec<D>,
}

impl<D> AddDocumentsRequest<D> {
    pub fn new(store_id: impl Into<StoreId>, documents: Vec<D>) -> Self {
        Self {
            store_id: store_id.into(),
            documents,
        }
    }
}

/// Stable structural digest of a request, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Digests an arbitrary JSON value with unordered arrays and sorted keys.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        Self(hex::encode(digest(value)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn filter_config_canonical(filter_config: &FilterConfig) -> Value {
    Value::Array(
        filter_config
            .iter()
            .map(|group| Value::Array(group.iter().map(FilterOperator::canonical).collect()))
            .collect(),
    )
}

fn strings_canonical(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

fn digest(value: &Value) -> [u8; 32] {
    let mut hasher = Sha256::new();
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(flag) => {
            hasher.update(b"b");
            hasher.update([u8::from(*flag)]);
        }
        Value::Number(number) => {
            hasher.update(b"#");
            hasher.update(number.to_string().as_bytes());
        }
        Value::String(text) => {
            hasher.update(b"s");
            hasher.update((text.len() as u64).to_le_bytes());
            hasher.update(text.as_bytes());
        }
        Value::Array(items) => {
            // multiset: element order must not matter
            let mut digests: Vec<[u8; 32]> = items.iter().map(digest).collect();
            digests.sort_unstable();
            hasher.update(b"a");
            hasher.update((digests.len() as u64).to_le_bytes());
            for item in &digests {
                hasher.update(item);
            }
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            hasher.update(b"o");
            hasher.update((entries.len() as u64).to_le_bytes());
            for (key, item) in entries {
                hasher.update((key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                hasher.update(digest(item));
            }
        }
    }
    hasher.finalize().into()
}

struct MemoEntry {
    request: Weak<QueryRequest>,
    fingerprint: Fingerprint,
    expires_at: Instant,
}

/// Fingerprints shared request instances, memoizing per instance for a short time.
///
/// The memo is keyed by the address of the `Arc` allocation. Each entry holds a
/// `Weak` to that allocation, so the address cannot be reused by another request
/// while the entry lives.
pub struct Fingerprinter {
    ttl: Duration,
    memo: DashMap<usize, MemoEntry>,
}

impl Fingerprinter {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            memo: DashMap::new(),
        }
    }

    /// Returns the fingerprint of `request`, reusing a memoized value for the same
    /// instance if it has not expired.
    pub fn fingerprint(&self, request: &Arc<QueryRequest>) -> Fingerprint {
        let now = Instant::now();
        let key = Arc::as_ptr(request) as usize;

        if let Some(entry) = self.memo.get(&key) {
            if entry.expires_at > now && std::ptr::eq(entry.request.as_ptr(), Arc::as_ptr(request)) {
                return entry.fingerprint.clone();
            }
        }

        self.memo.retain(|_, entry| entry.expires_at > now);

        let fingerprint = request.fingerprint();
        self.memo.insert(
            key,
            MemoEntry {
                request: Arc::downgrade(request),
                fingerprint: fingerprint.clone(),
                expires_at: now + self.ttl,
            },
        );
        fingerprint
    }

    /// Returns `true` if both requests have the same fingerprint.
    pub fn are_equal(&self, a: &Arc<QueryRequest>, b: &Arc<QueryRequest>) -> bool {
        Arc::ptr_eq(a, b) || self.fingerprint(a) == self.fingerprint(b)
    }

    /// Number of memoized fingerprints, expired entries included until the next miss.
    #[must_use]
    pub fn memoized(&self) -> usize {
        self.memo.len()
    }
}

impl fmt::Debug for Fingerprinter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fingerprinter")
            .field("ttl", &self.ttl)
            .field("memoized", &self.memo.len())
            .finish()
    }
}
