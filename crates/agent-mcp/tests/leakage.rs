//! Error responses must never carry filesystem paths or stack frames,
//! whatever the peer sends.

use agent_mcp::protocol::{decode, JsonRpcError, Message, Response};
use agent_mcp::server::McpServer;
use once_cell::sync::Lazy;
use proptest::prelude::*;
use regex::Regex;
use serde_json::json;

static PATH_LIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/[^/\s]+/\S+|[A-Za-z]:\\").unwrap());
static FRAME_LIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bat\s+\S.*:\d+:\d+").unwrap());

fn assert_clean(response: &Response) {
    let text = Message::Response(response.clone()).to_value().to_string();
    assert!(!PATH_LIKE.is_match(&text), "path leaked: {text}");
    assert!(!FRAME_LIKE.is_match(&text), "frame leaked: {text}");
}

fn server() -> McpServer {
    McpServer::builder().name("leak-test").build()
}

fn path() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z0-9_.]{1,8}", 2..6).prop_map(|segments| format!("/{}", segments.join("/")))
}

/// Word characters glued to the path by an arbitrary delimiter.
fn glued_path() -> impl Strategy<Value = String> {
    ("[a-z_]{0,6}", "[:|{<>@!]?", "[a-z]{0,4}", path())
        .prop_map(|(word, delimiter, tail, path)| format!("{word}{delimiter}{tail}{path}"))
}

fn frame() -> impl Strategy<Value = String> {
    ("[a-zA-Z_]{1,10}", path(), 1u32..5000, 1u32..120)
        .prop_map(|(func, file, line, col)| format!("\n    at {func} ({file}.js:{line}:{col})"))
}

fn call(server: &McpServer, message: Message) -> Response {
    tokio_test::block_on(server.handle_message(message, None)).expect("requests always get a response")
}

proptest! {
    #[test]
    fn prop_unknown_method_errors_are_clean(prefix in "[a-z/]{0,12}", path in path(), frame in frame()) {
        let method = format!("{prefix} {path}{frame}");
        let response = call(&server(), Message::request(1, method, None));
        prop_assert!(response.error_object().is_some());
        assert_clean(&response);
    }

    #[test]
    fn prop_glued_paths_in_method_names_are_clean(method in glued_path()) {
        let response = call(&server(), Message::request(1, method, None));
        prop_assert!(response.error_object().is_some());
        assert_clean(&response);
    }

    #[test]
    fn prop_unknown_tool_and_resource_errors_are_clean(path in path(), frame in frame()) {
        let server = server();
        let tool = format!("{path}{frame}");
        let response = call(&server, Message::request(2, "tools/call", Some(json!({"name": tool, "arguments": {}}))));
        assert_clean(&response);

        let uri = format!("file://{path}");
        let response = call(&server, Message::request(3, "resources/read", Some(json!({"uri": uri}))));
        assert_clean(&response);
    }

    #[test]
    fn prop_glued_paths_in_tools_and_uris_are_clean(
        name in glued_path(),
        authority in "[a-z]{1,6}",
        delimiter in "[:|{<>@!]?",
        path in path(),
    ) {
        let server = server();
        let response = call(&server, Message::request(2, "tools/call", Some(json!({"name": name}))));
        prop_assert!(response.error_object().is_some());
        assert_clean(&response);

        for uri in [format!("mcp://{authority}{delimiter}{path}"), name.clone()] {
            let response = call(&server, Message::request(3, "resources/read", Some(json!({"uri": uri}))));
            prop_assert!(response.error_object().is_some());
            assert_clean(&response);
        }
    }

    #[test]
    fn prop_decode_errors_say_nothing(raw in prop::collection::vec(any::<u8>(), 0..256)) {
        if let Err(e) = decode(&raw) {
            prop_assert_eq!(e.to_string(), "malformed message");
            let reply = Response::error(None, JsonRpcError::from(e));
            assert_clean(&reply);
        }
    }
}
