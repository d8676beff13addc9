pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use crate::shared::{ErrorType, NetworkError, NetworkResult};

/// Builds the default terminal logger. Deployments that want file output or
/// different levels should construct their own `slog::Logger` and hand it to
/// the router instead.
pub fn term_logger() -> NetworkResult<Logger> {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .map_err(|_| NetworkError::Fatal(ErrorType::Io(std::io::ErrorKind::InvalidData)))?;

    config
        .build_logger()
        .map_err(|_| NetworkError::Fatal(ErrorType::Io(std::io::ErrorKind::Other)))
}

/// Resolves an optional parent logger into a child or a discard sink.
#[inline]
pub fn child_or_discard(log: Option<&Logger>) -> Logger {
    match log {
        Some(log) => log.new(o!()),
        None => Logger::root(Discard, o!()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_logger_builds() {
        assert!(term_logger().is_ok());
    }

    #[test]
    fn test_child_or_discard() {
        let root = Logger::root(Discard, o!());
        let _child = child_or_discard(Some(&root));
        let _discard = child_or_discard(None);
    }
}
