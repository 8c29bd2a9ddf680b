//! Header map with case-insensitive lookup.

/// Ordered, multi-value header fields.
///
/// Names compare case-insensitively. Repeated fields stay separate entries,
/// which matters for `X-Forwarded-For`: only the first line is trusted as the
/// client chain.
///
/// ```
/// use earngate::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("X-Forwarded-For", "203.0.113.7, 10.0.0.1");
/// headers.insert("x-forwarded-for", "10.0.0.2");
///
/// assert_eq!(headers.get("X-FORWARDED-FOR"), Some("203.0.113.7, 10.0.0.1"));
/// assert_eq!(headers.get_all("x-forwarded-for").count(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Appends a field; earlier values under the same name are kept.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value recorded under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value under `name`, in arrival order.
    pub fn get_all<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
