//! Generate sample frames for browser client interop testing.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::messages::*;

fn main() {
    // Inbound: new-session
    let new_session = Envelope::terminal(&TerminalRequest::NewSession(NewSession {
        namespace: "default".to_string(),
        pod: "web-0".to_string(),
    }))
    .expect("envelope");
    print_inbound("new_session", &new_session);

    // Inbound: type
    let type_text = Envelope::terminal(&TerminalRequest::Type(TypeText {
        text: "echo hi\n".to_string(),
    }))
    .expect("envelope");
    print_inbound("type", &type_text);

    // Outbound frames
    print_outbound(
        "new_session_reply",
        &OutboundFrame::new_session("3f2b8a3e-4c1d-4e7a-9b0f-2d6c5e8a1b7c"),
    );
    print_outbound("update_stdout", &OutboundFrame::update(StreamKind::Stdout, b"hi\r\n"));
    print_outbound(
        "update_stderr_binary",
        &OutboundFrame::update(StreamKind::Stderr, &[0x1b, b'[', b'0', b'm', 0xff]),
    );
    print_outbound("eof_stdout", &OutboundFrame::eof(StreamKind::Stdout));
    print_outbound("eof_stderr", &OutboundFrame::eof(StreamKind::Stderr));
    print_outbound("error_no_handler", &OutboundFrame::error(errors::NO_HANDLER));
    print_outbound("error_session_needed", &OutboundFrame::error(errors::SESSION_NEEDED));

    // Resize
    let resize = ResizeResponse::Echo {
        req: ResizeRequest { cols: 120, rows: 40 },
    };
    println!(
        "resize_echo: {}",
        serde_json::to_string(&resize).expect("serialize")
    );
    println!(
        "resize_not_found: {}",
        serde_json::to_string(&ResizeResponse::not_found("unknown-id")).expect("serialize")
    );
}

fn print_inbound(name: &str, envelope: &Envelope) {
    println!("{}: {}", name, envelope.to_json().expect("serialize"));
}

fn print_outbound(name: &str, frame: &OutboundFrame) {
    println!("{}: {}", name, frame.to_json().expect("serialize"));
}
