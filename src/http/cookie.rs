use std::time::{Duration, SystemTime};

/// `SameSite` cookie attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    #[inline]
    const fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

/// A cookie sent with a [`Response`](crate::Response) as one `set-cookie` line.
///
/// `max_age` is turned into an `Expires` date when the response is written,
/// counted from that moment rather than from the creation of the cookie.
///
/// # Examples
/// ```
/// use maker_ws::{Cookie, Response, SameSite, StatusCode};
/// use std::time::Duration;
///
/// let session = Cookie::new("session", "f3a9c1")
///     .path("/")
///     .max_age(Duration::from_secs(3600))
///     .http_only(true)
///     .same_site(SameSite::Lax);
///
/// let resp = Response::new(StatusCode::Ok).cookie(session).body("logged in");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    domain: Option<String>,
    path: Option<String>,
    max_age: Option<Duration>,
    secure: bool,
    http_only: bool,
    same_site: Option<SameSite>,
}

impl Cookie {
    /// Creates a session cookie without attributes.
    ///
    /// # Panics
    /// In `debug` mode, when the name is empty or either part contains
    /// `;`, `,`, whitespace or control characters.
    #[track_caller]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let (name, value) = (name.into(), value.into());

        debug_assert!(
            !name.is_empty() && name.bytes().all(is_cookie_octet) && !name.contains('='),
            "Invalid cookie name: {name:?}"
        );
        debug_assert!(
            value.bytes().all(is_cookie_octet),
            "Invalid cookie value: {value:?}"
        );

        Self {
            name,
            value,
            domain: None,
            path: None,
            max_age: None,
            secure: false,
            http_only: false,
            same_site: None,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn value(&self) -> &str {
        &self.value
    }

    #[inline]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    #[inline]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Lifetime of the cookie. `Duration::ZERO` asks the client to delete it.
    #[inline]
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    #[inline]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    #[inline]
    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    #[inline]
    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = Some(same_site);
        self
    }

    /// Writes the whole `set-cookie` header line, CRLF included.
    pub(crate) fn write_line(&self, now: SystemTime, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(b"set-cookie: ");
        buffer.extend_from_slice(self.name.as_bytes());
        buffer.push(b'=');
        buffer.extend_from_slice(self.value.as_bytes());

        if let Some(max_age) = self.max_age {
            let expires = match max_age.is_zero() {
                true => SystemTime::UNIX_EPOCH,
                false => now + max_age,
            };

            buffer.extend_from_slice(b"; Expires=");
            buffer.extend_from_slice(httpdate::fmt_http_date(expires).as_bytes());
        }

        let attrs = [("; Domain=", &self.domain), ("; Path=", &self.path)];
        for (prefix, value) in attrs {
            if let Some(value) = value {
                buffer.extend_from_slice(prefix.as_bytes());
                buffer.extend_from_slice(value.as_bytes());
            }
        }

        if self.secure {
            buffer.extend_from_slice(b"; Secure");
        }
        if self.http_only {
            buffer.extend_from_slice(b"; HttpOnly");
        }
        if let Some(same_site) = self.same_site {
            buffer.extend_from_slice(b"; SameSite=");
            buffer.extend_from_slice(same_site.as_str().as_bytes());
        }

        buffer.extend_from_slice(b"\r\n");
    }
}

// RFC 6265, 4.1.1
#[inline]
const fn is_cookie_octet(byte: u8) -> bool {
    matches!(byte, 0x21 | 0x23..=0x2B | 0x2D..=0x3A | 0x3C..=0x5B | 0x5D..=0x7E)
}
