#![allow(dead_code)]

use bytes::BytesMut;
use redmux::{NodeParser, Resp3Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// What the scripted server does with one received command.
pub enum ServerReply {
    /// Write these bytes (replies and/or pushes).
    Send(Vec<u8>),
    /// Write these bytes, then close the connection.
    SendAndClose(Vec<u8>),
    /// Swallow the command.
    Ignore,
}

/// Drives the server half of a duplex pipe: decodes incoming command
/// arrays and feeds them to `respond` one at a time.  Returns when the
/// client half closes or the script asks to close.
pub async fn serve<F>(mut stream: DuplexStream, mut respond: F)
where
    F: FnMut(&str, &[Vec<u8>]) -> ServerReply,
{
    let mut parser = NodeParser::default();
    let mut buf = BytesMut::new();
    loop {
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        while let Some(tree) = parser.parse(&mut buf).expect("well-formed client command") {
            let (verb, args) = decode_command(&tree);
            match respond(&verb, &args) {
                ServerReply::Send(bytes) => {
                    if stream.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                ServerReply::SendAndClose(bytes) => {
                    let _ = stream.write_all(&bytes).await;
                    return;
                }
                ServerReply::Ignore => {}
            }
        }
    }
}

/// The stock command table used by most tests: `HELLO` gets a server-info
/// map, `PING` echoes its argument, `SUBSCRIBE` acknowledges out of band,
/// `QUIT` says OK and closes.
pub fn default_reply(verb: &str, args: &[Vec<u8>]) -> ServerReply {
    match verb {
        "HELLO" => ServerReply::Send(b"%1\r\n$6\r\nserver\r\n$5\r\nredis\r\n".to_vec()),
        "PING" => match args.first() {
            Some(msg) => ServerReply::Send(bulk(msg)),
            None => ServerReply::Send(b"+PONG\r\n".to_vec()),
        },
        "SUBSCRIBE" => {
            let channel = args.first().cloned().unwrap_or_default();
            let mut push = b">3\r\n$9\r\nsubscribe\r\n".to_vec();
            push.extend_from_slice(&bulk(&channel));
            push.extend_from_slice(b":1\r\n");
            ServerReply::Send(push)
        }
        "QUIT" => ServerReply::SendAndClose(b"+OK\r\n".to_vec()),
        _ => ServerReply::Send(b"-ERR unknown command\r\n".to_vec()),
    }
}

/// Encodes one bulk string.
pub fn bulk(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    out
}

/// Encodes a pub/sub `message` push for `channel`.
pub fn message_push(channel: &str, payload: &str) -> Vec<u8> {
    let mut out = b">3\r\n$7\r\nmessage\r\n".to_vec();
    out.extend_from_slice(&bulk(channel.as_bytes()));
    out.extend_from_slice(&bulk(payload.as_bytes()));
    out
}

// A client command is an array of bulk strings; the first is the verb.
fn decode_command(tree: &[redmux::Node]) -> (String, Vec<Vec<u8>>) {
    assert_eq!(tree[0].kind, Resp3Type::Array, "commands are arrays");
    let mut bulks = tree[1..]
        .iter()
        .map(|node| node.value.as_blob().expect("bulk argument").to_vec());
    let verb = String::from_utf8(bulks.next().expect("non-empty command"))
        .expect("ascii verb")
        .to_ascii_uppercase();
    (verb, bulks.collect())
}
