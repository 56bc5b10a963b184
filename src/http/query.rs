//! URL query string and `application/x-www-form-urlencoded` decoder.

use memchr::memchr;
use percent_encoding::percent_decode;
use std::{borrow::Cow, collections::HashMap};

/// Decoding query strings and form bodies into owned, percent-decoded pairs.
///
/// `+` is decoded as a space, `%XX` escapes are resolved and the result must
/// be valid UTF-8.
///
/// # Examples
/// ```rust
/// use maker_ws::query::Query;
/// use std::collections::HashMap;
///
/// // Parse into Vec (preserves order)
/// let query = b"name=john+doe&age=25&city";
/// let vec_params: Vec<(String, String)> = Query::parse(query, 10).unwrap();
/// assert_eq!(vec_params[0], ("name".to_string(), "john doe".to_string()));
/// assert_eq!(vec_params.len(), 3);
///
/// // Parse into HashMap (last value wins)
/// let hash_params: HashMap<String, String> = Query::parse(b"k=1&k=%32", 10).unwrap();
/// assert_eq!(hash_params["k"], "2");
///
/// // Handle limits
/// let result = Query::parse::<Vec<(String, String)>>(b"a=1&b=2", 1);
/// assert!(result.is_err()); // Exceeds limit of 1 parameter
/// ```
pub struct Query;

impl Query {
    /// Parses a query string into a new collection.
    ///
    /// A leading `?` is skipped, so `?a=1` and `a=1` are equivalent. Empty
    /// input yields an empty collection.
    #[inline(always)]
    pub fn parse<C: QueryCollector>(query: &[u8], limit: usize) -> Result<C, Error> {
        let mut result = C::with_capacity(limit.min(16));
        Self::parse_into(&mut result, query, limit)?;
        Ok(result)
    }

    /// Parses a query string into an existing collection, appending pairs.
    ///
    /// # Examples
    /// ```
    /// use maker_ws::query::Query;
    ///
    /// let mut collector: Vec<(String, String)> = Vec::new();
    /// Query::parse_into(&mut collector, b"email=user%40example.com", 10).unwrap();
    /// assert_eq!(collector[0].1, "user@example.com");
    /// ```
    pub fn parse_into<C: QueryCollector>(
        result: &mut C,
        query: &[u8],
        limit: usize,
    ) -> Result<(), Error> {
        let data = match query.first() {
            Some(b'?') => &query[1..],
            _ => query,
        };

        let mut start = 0;
        while start < data.len() {
            let end = memchr(b'&', &data[start..])
                .map(|pos| start + pos)
                .unwrap_or(data.len());

            // `a&&b` carries an empty pair, skipped
            if start == end {
                start = end + 1;
                continue;
            }

            if result.length() >= limit {
                return Err(Error::OverLimit(limit));
            }

            let split = memchr(b'=', &data[start..end])
                .map(|pos| start + pos)
                .unwrap_or(end);

            let key = decode_component(&data[start..split], true)?;
            let value = match split < end {
                true => decode_component(&data[split + 1..end], true)?,
                false => String::new(),
            };

            result.add_param(key, value);
            start = end + 1;
        }

        Ok(())
    }
}

/// Percent-decodes one URI component.
///
/// With `plus_as_space` set, `+` turns into a space first (form encoding).
pub(crate) fn decode_component(raw: &[u8], plus_as_space: bool) -> Result<String, Error> {
    let raw: Cow<'_, [u8]> = match plus_as_space && memchr(b'+', raw).is_some() {
        true => Cow::Owned(
            raw.iter()
                .map(|&b| if b == b'+' { b' ' } else { b })
                .collect(),
        ),
        false => Cow::Borrowed(raw),
    };

    percent_decode(&raw)
        .decode_utf8()
        .map(Cow::into_owned)
        .map_err(|_| Error::InvalidEncoding)
}

/// A trait for types that can collect decoded query parameters.
///
/// # Examples
/// ```rust
/// use maker_ws::query::QueryCollector;
///
/// struct Keys(Vec<String>);
///
/// impl QueryCollector for Keys {
///     fn add_param(&mut self, key: String, _: String) {
///         self.0.push(key);
///     }
///
///     fn length(&self) -> usize {
///         self.0.len()
///     }
///
///     fn with_capacity(capacity: usize) -> Self {
///         Keys(Vec::with_capacity(capacity))
///     }
/// }
/// ```
pub trait QueryCollector
where
    Self: Sized,
{
    /// Adds a decoded parameter to the collection.
    fn add_param(&mut self, key: String, value: String);

    /// Returns the current number of parameters in the collection.
    fn length(&self) -> usize;

    /// Creates a new collection with the specified capacity.
    fn with_capacity(capacity: usize) -> Self;
}

impl QueryCollector for Vec<(String, String)> {
    #[inline(always)]
    fn add_param(&mut self, key: String, value: String) {
        self.push((key, value));
    }

    #[inline(always)]
    fn length(&self) -> usize {
        self.len()
    }

    #[inline(always)]
    fn with_capacity(capacity: usize) -> Self {
        Vec::with_capacity(capacity)
    }
}

// Deduplicates parameters, last wins
impl QueryCollector for HashMap<String, String> {
    #[inline(always)]
    fn add_param(&mut self, key: String, value: String) {
        self.insert(key, value);
    }

    #[inline(always)]
    fn length(&self) -> usize {
        self.len()
    }

    #[inline(always)]
    fn with_capacity(capacity: usize) -> Self {
        HashMap::with_capacity(capacity)
    }
}

/// Error types that can occur during query parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The number of parameters exceeded the limit given to the parser.
    #[error("query parameter limit exceeded: limit={0}")]
    OverLimit(usize),

    /// A component did not decode to valid UTF-8.
    #[error("query component is not valid percent-encoded UTF-8")]
    InvalidEncoding,
}
