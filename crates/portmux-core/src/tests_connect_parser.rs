use super::{
    parse_connect_request_head, parse_connect_request_line, ConnectParseError,
};

#[test]
fn parses_canonical_connect_line() {
    let request =
        parse_connect_request_line("CONNECT example.com:8443 HTTP/1.1").expect("parse connect");
    assert_eq!(request.server_host, "example.com");
    assert_eq!(request.server_port, 8443);
}

#[test]
fn parses_bracketed_ipv6_authority() {
    let request =
        parse_connect_request_line("CONNECT [2001:db8::1]:443 HTTP/1.1").expect("parse connect");
    assert_eq!(request.server_host, "2001:db8::1");
    assert_eq!(request.server_port, 443);
}

#[test]
fn rejects_lowercase_method() {
    let err = parse_connect_request_line("connect example.com:443 HTTP/1.1")
        .expect_err("lowercase method must fail");
    assert_eq!(err, ConnectParseError::MethodNotConnect);
}

#[test]
fn rejects_missing_port() {
    let err = parse_connect_request_line("CONNECT example.com HTTP/1.1")
        .expect_err("missing port must fail");
    assert_eq!(err, ConnectParseError::MissingPort);
}

#[test]
fn rejects_non_http_version() {
    let err = parse_connect_request_line("CONNECT example.com:443 SPDY/3")
        .expect_err("bad version must fail");
    assert_eq!(err, ConnectParseError::InvalidHttpVersion);
}

#[test]
fn head_parser_reports_consumed_length() {
    let head = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\nLEFTOVER";
    let (request, consumed) = parse_connect_request_head(head).expect("parse head");
    assert_eq!(request.server_host, "example.com");
    assert_eq!(&head[consumed..], b"LEFTOVER");
}

#[test]
fn head_parser_waits_for_full_headers() {
    let err = parse_connect_request_head(b"CONNECT example.com:443 HTTP/1.1\r\nHost:")
        .expect_err("partial head must fail");
    assert_eq!(err, ConnectParseError::IncompleteHeaders);
}
