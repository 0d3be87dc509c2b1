/// Which broker/backend family a connection URI's scheme selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// `amqp`, `amqps`, `rpc`, `rpcs`.
    Amqp,
    /// `redis`, `rediss`, `redis+socket`, `rediss+socket`, `sentinel`,
    /// `sentinels`.
    Redis,
}

/// Recognizes the scheme of a broker/backend URI, returning the family it
/// selects along with the URI normalized for connecting with that family's
/// transport (`rpc`/`rpcs` are rewritten to `amqp`/`amqps`, since the RPC
/// result backend rides the same AMQP connection as an AMQP broker).
pub fn recognize(uri: &str) -> Option<(Family, String)> {
    // `Url::parse` both validates general well-formedness and gives us a
    // reliable scheme even for schemes `str::split_once` would mishandle
    // (e.g. a malformed URI with no `://` at all).
    let parsed = url::Url::parse(uri).ok()?;
    let rest = &uri[parsed.scheme().len()..];

    match parsed.scheme() {
        "amqp" | "amqps" => Some((Family::Amqp, uri.to_owned())),
        "rpc" => Some((Family::Amqp, format!("amqp{rest}"))),
        "rpcs" => Some((Family::Amqp, format!("amqps{rest}"))),
        "redis" | "rediss" | "redis+socket" | "rediss+socket" | "sentinel" | "sentinels" => {
            Some((Family::Redis, uri.to_owned()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn amqp_and_redis_schemes_pass_through_unchanged() {
        assert_eq!(recognize("amqp://localhost"), Some((Family::Amqp, "amqp://localhost".to_owned())));
        assert_eq!(recognize("redis://localhost"), Some((Family::Redis, "redis://localhost".to_owned())));
    }

    #[test]
    fn rpc_schemes_are_rewritten_to_amqp() {
        assert_eq!(recognize("rpc://localhost"), Some((Family::Amqp, "amqp://localhost".to_owned())));
        assert_eq!(recognize("rpcs://localhost"), Some((Family::Amqp, "amqps://localhost".to_owned())));
    }

    #[test]
    fn unrecognized_schemes_return_none() {
        assert_eq!(recognize("http://localhost"), None);
    }
}
