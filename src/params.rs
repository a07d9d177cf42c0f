//! 上传会话参数解析：从查询串或表单字段中取出五个会话字段。

use axum::http::Method;
use bytes::Bytes;
use std::collections::HashMap;

pub const DEFAULT_PARAM_PREFIX: &str = "resumable";

/// The five logical fields of an upload session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionField {
    Identifier,
    Filename,
    ChunkNumber,
    ChunkSize,
    TotalSize,
}

impl SessionField {
    pub const ALL: [SessionField; 5] = [
        SessionField::Identifier,
        SessionField::Filename,
        SessionField::ChunkNumber,
        SessionField::ChunkSize,
        SessionField::TotalSize,
    ];

    pub fn default_name(self) -> &'static str {
        match self {
            SessionField::Identifier => "identifier",
            SessionField::Filename => "filename",
            SessionField::ChunkNumber => "chunkNumber",
            SessionField::ChunkSize => "chunkSize",
            SessionField::TotalSize => "totalSize",
        }
    }
}

/// Maps logical session fields onto wire parameter names.
///
/// The wire name is the prefix followed by the short name with its first
/// letter upper-cased, so `filename` travels as `resumableFilename`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldMapping {
    prefix: String,
    names: [String; 5],
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PARAM_PREFIX.to_string(),
            names: SessionField::ALL.map(|field| field.default_name().to_string()),
        }
    }
}

impl FieldMapping {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Overrides one short name; the other fields keep their current names.
    pub fn with_field(mut self, field: SessionField, name: impl Into<String>) -> Self {
        self.names[field as usize] = name.into();
        self
    }

    pub fn short_name(&self, field: SessionField) -> &str {
        &self.names[field as usize]
    }

    pub fn wire_name(&self, field: SessionField) -> String {
        let short = self.short_name(field);
        if self.prefix.is_empty() {
            return short.to_string();
        }
        let mut chars = short.chars();
        match chars.next() {
            Some(first) => format!("{}{}{}", self.prefix, first.to_uppercase(), chars.as_str()),
            None => self.prefix.clone(),
        }
    }
}

/// Everything the engine needs from one transport request.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub method: Method,
    pub query: HashMap<String, String>,
    pub body: HashMap<String, String>,
    pub payload: Option<Bytes>,
}

impl RequestContext {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            query: HashMap::new(),
            body: HashMap::new(),
            payload: None,
        }
    }

    /// A read-style probe carrying query parameters.
    #[cfg(test)]
    pub fn probe(query: HashMap<String, String>) -> Self {
        Self {
            query,
            ..Self::new(Method::GET)
        }
    }

    /// A chunk write carrying body parameters and the chunk bytes.
    #[cfg(test)]
    pub fn chunk(body: HashMap<String, String>, payload: Bytes) -> Self {
        Self {
            body,
            payload: Some(payload),
            ..Self::new(Method::POST)
        }
    }
}

/// Raw session fields as sent by the client; absent ones are `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionParams {
    pub identifier: Option<String>,
    pub filename: Option<String>,
    pub chunk_number: Option<String>,
    pub chunk_size: Option<String>,
    pub total_size: Option<String>,
}

impl SessionParams {
    pub fn get(&self, field: SessionField) -> Option<&str> {
        match field {
            SessionField::Identifier => self.identifier.as_deref(),
            SessionField::Filename => self.filename.as_deref(),
            SessionField::ChunkNumber => self.chunk_number.as_deref(),
            SessionField::ChunkSize => self.chunk_size.as_deref(),
            SessionField::TotalSize => self.total_size.as_deref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        SessionField::ALL.iter().all(|field| self.get(*field).is_none())
    }
}

#[derive(Clone, Debug, Default)]
pub struct ParamResolver {
    mapping: FieldMapping,
}

impl ParamResolver {
    pub fn new(mapping: FieldMapping) -> Self {
        Self { mapping }
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    /// GET reads the query string, POST the body; anything else has no
    /// parameters at all.
    pub fn params<'a>(&self, ctx: &'a RequestContext) -> Option<&'a HashMap<String, String>> {
        if ctx.method == Method::GET {
            Some(&ctx.query)
        } else if ctx.method == Method::POST {
            Some(&ctx.body)
        } else {
            None
        }
    }

    pub fn param(&self, ctx: &RequestContext, field: SessionField) -> Option<String> {
        self.params(ctx)?
            .get(&self.mapping.wire_name(field))
            .cloned()
    }

    pub fn resolve(&self, ctx: &RequestContext) -> SessionParams {
        SessionParams {
            identifier: self.param(ctx, SessionField::Identifier),
            filename: self.param(ctx, SessionField::Filename),
            chunk_number: self.param(ctx, SessionField::ChunkNumber),
            chunk_size: self.param(ctx, SessionField::ChunkSize),
            total_size: self.param(ctx, SessionField::TotalSize),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resumable_params() -> HashMap<String, String> {
        [
            ("resumableChunkNumber", "1"),
            ("resumableTotalChunks", "100"),
            ("resumableChunkSize", "1000"),
            ("resumableTotalSize", "100000"),
            ("resumableIdentifier", "100"),
            ("resumableFilename", "mock_file_name"),
            ("resumableRelativePath", "upload"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
    }

    #[test]
    fn default_wire_names_carry_prefix() {
        let mapping = FieldMapping::default();
        assert_eq!(mapping.wire_name(SessionField::Filename), "resumableFilename");
        assert_eq!(
            mapping.wire_name(SessionField::ChunkNumber),
            "resumableChunkNumber"
        );
        assert_eq!(
            FieldMapping::default()
                .with_prefix("")
                .wire_name(SessionField::TotalSize),
            "totalSize"
        );
    }

    #[test]
    fn get_reads_query_params() {
        let resolver = ParamResolver::default();
        let ctx = RequestContext::probe(resumable_params());

        let params = resolver.resolve(&ctx);
        assert_eq!(params.identifier.as_deref(), Some("100"));
        assert_eq!(params.filename.as_deref(), Some("mock_file_name"));
        assert_eq!(params.chunk_number.as_deref(), Some("1"));
        assert_eq!(params.chunk_size.as_deref(), Some("1000"));
        assert_eq!(params.total_size.as_deref(), Some("100000"));
        assert_eq!(resolver.params(&ctx), Some(&resumable_params()));
    }

    #[test]
    fn post_reads_body_not_query() {
        let resolver = ParamResolver::default();
        let mut ctx = RequestContext::chunk(resumable_params(), Bytes::from_static(b"x"));
        ctx.query
            .insert("resumableIdentifier".into(), "from-query".into());

        let params = resolver.resolve(&ctx);
        assert_eq!(params.identifier.as_deref(), Some("100"));
    }

    #[test]
    fn other_methods_resolve_nothing() {
        let resolver = ParamResolver::default();
        let mut ctx = RequestContext::new(Method::PUT);
        ctx.query = resumable_params();
        ctx.body = resumable_params();

        assert!(resolver.params(&ctx).is_none());
        assert!(resolver.resolve(&ctx).is_empty());
    }

    #[test]
    fn missing_fields_are_absent() {
        let resolver = ParamResolver::default();
        let mut query = HashMap::new();
        query.insert("resumableFilename".to_string(), "a.txt".to_string());

        let params = resolver.resolve(&RequestContext::probe(query));
        assert!(!params.is_empty());
        assert_eq!(params.filename.as_deref(), Some("a.txt"));
        assert!(params.identifier.is_none());
        assert!(params.total_size.is_none());
    }

    #[test]
    fn custom_mapping_overrides_single_field() {
        let mapping = FieldMapping::default()
            .with_prefix("flow")
            .with_field(SessionField::Identifier, "uploadToken");
        let resolver = ParamResolver::new(mapping);
        let mut query = HashMap::new();
        query.insert("flowUploadToken".to_string(), "tok".to_string());
        query.insert("flowFilename".to_string(), "b.bin".to_string());

        let params = resolver.resolve(&RequestContext::probe(query));
        assert_eq!(params.identifier.as_deref(), Some("tok"));
        assert_eq!(params.filename.as_deref(), Some("b.bin"));
        assert_eq!(
            resolver.mapping().short_name(SessionField::ChunkSize),
            "chunkSize"
        );
    }
}
