use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// The exploded form of a connection string.
///
/// Connection strings have the format
///  `(<System>)<type>:<address>[:<extra>...]` where `<System>` selects an
///  installed network system, `<type>` is the connection mode (`direct` for
///  stream connections, `passive` for datagrams) and each `<extra>` is either
///  a `key=value` pair or a positional value (the port is usually the first
///  positional value), e.g.
///
/// ```text
/// (Socket)direct:127.0.0.1:1234
/// (Socket)direct:127.0.0.1:1234:security=tls:ca=cacert.pem:commonName=host
/// (Socket)passive:ANY:5678:broadcast=true
/// ```
#[derive(Clone, Debug, Default)]
pub struct ConnectionDetails {
    system: Option<String>,
    conn_type: Option<String>,
    address: Option<String>,
    named: Vec<(String, String)>,
    positional: Vec<String>,
    original: String,
}

impl ConnectionDetails {
    pub fn parse(connection_string: &str) -> ConnectionDetails {
        let mut details = ConnectionDetails {
            original: connection_string.to_string(),
            ..Default::default()
        };

        let mut rest = connection_string;
        if let Some(stripped) = rest.strip_prefix('(') {
            if let Some(end) = stripped.find(')') {
                details.system = Some(stripped[..end].to_string());
                rest = &stripped[end + 1..];
            }
        }

        let mut parts = rest.split(':');
        if let Some(conn_type) = parts.next() {
            if !conn_type.is_empty() {
                details.conn_type = Some(conn_type.to_string());
            }
        }
        if let Some(address) = parts.next() {
            if !address.is_empty() {
                details.address = Some(address.to_string());
            }
        }
        for extra in parts {
            match extra.split_once('=') {
                Some((key, value)) => details.named.push((key.to_string(), value.to_string())),
                None => details.positional.push(extra.to_string()),
            }
        }
        details
    }

    pub fn system(&self) -> Option<&str> {
        self.system.as_deref()
    }

    pub fn conn_type(&self) -> Option<&str> {
        self.conn_type.as_deref()
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn has_system(&self) -> bool {
        self.system.is_some()
    }

    /// Get a `key=value` extra by name. If the same key was given more than
    ///  once only the first value is used.
    pub fn get<T: FromStr>(&self, name: &str, default: T) -> T {
        self.named
            .iter()
            .find(|(k, _)| k == name)
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(default)
    }

    /// Get a positional extra by index. Key-value extras do not count towards
    ///  the index.
    pub fn get_at<T: FromStr>(&self, index: usize, default: T) -> T {
        self.positional
            .get(index)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Get an extra by name, falling back to a positional index. The port is
    ///  commonly spelled either `port=1234` or as the first positional extra.
    pub fn get_with_index_fallback<T: FromStr + Copy>(
        &self,
        name: &str,
        index: usize,
        default: T,
    ) -> T {
        self.get(name, self.get_at(index, default))
    }
}

impl Display for ConnectionDetails {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::full("(Socket)direct:127.0.0.1:1234", Some("Socket"), Some("direct"), Some("127.0.0.1"), 1234)]
    #[case::no_system("direct:127.0.0.1:1624", None, Some("direct"), Some("127.0.0.1"), 1624)]
    #[case::named_port("(Socket)direct:host.example:port=80", Some("Socket"), Some("direct"), Some("host.example"), 80)]
    #[case::any("(Socket)passive:ANY:5678", Some("Socket"), Some("passive"), Some("ANY"), 5678)]
    fn test_parse(
        #[case] input: &str,
        #[case] system: Option<&str>,
        #[case] conn_type: Option<&str>,
        #[case] address: Option<&str>,
        #[case] port: u16,
    ) {
        let details = ConnectionDetails::parse(input);
        assert_eq!(details.system(), system);
        assert_eq!(details.conn_type(), conn_type);
        assert_eq!(details.address(), address);
        assert_eq!(details.get_with_index_fallback("port", 0, 0u16), port);
    }

    #[test]
    fn test_key_value_extras() {
        let details = ConnectionDetails::parse(
            "(Socket)direct:127.0.0.1:1234:security=tls:ca=data/cacert.pem:commonName=tlstest",
        );
        assert_eq!(details.get("security", String::new()), "tls");
        assert_eq!(details.get("ca", String::new()), "data/cacert.pem");
        assert_eq!(details.get("commonName", String::new()), "tlstest");
        assert_eq!(details.get("missing", String::from("fallback")), "fallback");
        assert_eq!(details.get_with_index_fallback("port", 0, 0u16), 1234);
    }

    #[test]
    fn test_display_preserves_original() {
        let raw = "(Socket)direct:127.0.0.1:1234:security=tls";
        assert_eq!(ConnectionDetails::parse(raw).to_string(), raw);
    }

    #[test]
    fn test_empty_string() {
        let details = ConnectionDetails::parse("");
        assert!(!details.has_system());
        assert_eq!(details.conn_type(), None);
        assert_eq!(details.address(), None);
    }
}
