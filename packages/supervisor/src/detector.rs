// ABOUTME: Best-effort listening-port detection from process output lines
// ABOUTME: Pluggable via PortDetector; a missed port is acceptable, a wrong one is not

use once_cell::sync::Lazy;
use regex::Regex;

/// Keyword followed by a 4-5 digit number: "port 3000", "listening on 8080", "Local: http://localhost:5173"
static KEYWORD_PORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:port|listening on|on port|url:|local:.*?)\s*[:\- ]\s*(\d{4,5})\b")
        .expect("keyword port regex is valid")
});

/// Loopback URL with an explicit port: "http://localhost:5173/", "http://127.0.0.1:3000"
static URL_PORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bhttps?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):(\d{4,5})\b")
        .expect("url port regex is valid")
});

/// Extracts a listening port from a line of process output.
pub trait PortDetector: Send + Sync {
    fn detect(&self, line: &str) -> Option<u16>;
}

/// Default heuristic: keyword patterns first, then loopback URLs.
#[derive(Debug, Default, Clone, Copy)]
pub struct OutputPortHeuristic;

impl PortDetector for OutputPortHeuristic {
    fn detect(&self, line: &str) -> Option<u16> {
        [&*KEYWORD_PORT, &*URL_PORT]
            .iter()
            .filter_map(|regex| regex.captures(line))
            .filter_map(|captures| captures.get(1))
            .find_map(|port| parse_port(port.as_str()))
    }
}

fn parse_port(digits: &str) -> Option<u16> {
    digits.parse::<u16>().ok().filter(|port| *port >= 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("listening on port 4123", Some(4123))]
    #[case("Server listening on 8080", Some(8080))]
    #[case("Express server running on port 8476", Some(8476))]
    #[case("  ➜  Local:   http://localhost:5173/", Some(5173))]
    #[case("PORT: 3000", Some(3000))]
    #[case("url: http://127.0.0.1:4000", Some(4000))]
    #[case("Server running at http://127.0.0.1:3000/ for project demo", Some(3000))]
    #[case("ready - started server on http://localhost:3001", Some(3001))]
    fn test_detects_port(#[case] line: &str, #[case] expected: Option<u16>) {
        assert_eq!(OutputPortHeuristic.detect(line), expected);
    }

    #[rstest]
    #[case("compiled 1234 modules")]
    #[case("Report 12345 generated")]
    #[case("port 99999")]
    #[case("port 80")]
    #[case("listening on port 123456")]
    #[case("")]
    fn test_rejects_non_ports(#[case] line: &str) {
        assert_eq!(OutputPortHeuristic.detect(line), None);
    }
}
