use fastcgi_server::{
    conn::{Connection, Sequential},
    Response, ServerConfig,
};
use std::sync::Arc;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

mod common;
use common::*;

fn echo_request_bytes() -> Vec<u8> {
    let mut input = begin_request(1, false);
    input.extend_from_slice(&params(1, &[("REQUEST_METHOD", "POST")]));
    input.extend_from_slice(&record(STDIN, 1, b"split me"));
    input.extend_from_slice(&record(STDIN, 1, &[]));
    input
}

async fn serve_chunked(input: &[u8], chunk: usize) -> Vec<u8> {
    setup();

    let (mut client, server) = duplex(1 << 16);
    let task = tokio::spawn(Connection::<_, _, Sequential>::serve(
        server,
        Arc::new(ServerConfig::default()),
        Arc::new(|mut request: fastcgi_server::Request, response: Response| async move {
            let body = request.stdin_mut().get_all().await?;
            response.put(&body).await
        }),
    ));

    for piece in input.chunks(chunk) {
        client.write_all(piece).await.unwrap();
        client.flush().await.unwrap();
        // Yield so the reader observes genuinely partial reads.
        tokio::task::yield_now().await;
    }

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    task.await.unwrap().unwrap();
    out
}

#[tokio::test]
async fn record_sequence_is_split_point_independent() {
    let input = echo_request_bytes();

    let whole = serve_chunked(&input, input.len()).await;
    for chunk in [1, 3, 7, 8, 13] {
        let pieced = serve_chunked(&input, chunk).await;
        assert_eq!(pieced, whole, "chunk size {chunk} changed the output");
    }

    let records = parse_records(&whole);
    assert!(stdout_of(&records, 1).ends_with(b"split me"));
}

#[tokio::test]
async fn padded_records_are_accepted() {
    setup();

    let (mut client, server) = duplex(1 << 16);
    let task = tokio::spawn(Connection::<_, _, Sequential>::serve(
        server,
        Arc::new(ServerConfig::default()),
        Arc::new(|request: fastcgi_server::Request, response: Response| async move {
            let method = request.params().request_method().unwrap_or("?").to_owned();
            response.put_str(&method).await
        }),
    ));

    // Hand-built records carrying 5 bytes of padding each.
    let mut input = Vec::new();
    let padded = |r#type: u8, id: u16, content: &[u8]| {
        let mut buf = record(r#type, id, content);
        buf[6] = 5;
        buf.extend_from_slice(&[0xAA; 5]);
        buf
    };
    input.extend_from_slice(&padded(BEGIN_REQUEST, 1, &[0, 1, 0, 0, 0, 0, 0, 0]));
    input.extend_from_slice(&padded(PARAMS, 1, &nv_pairs(&[("REQUEST_METHOD", "GET")])));
    input.extend_from_slice(&padded(PARAMS, 1, &[]));
    input.extend_from_slice(&padded(STDIN, 1, &[]));
    client.write_all(&input).await.unwrap();

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    task.await.unwrap().unwrap();

    let records = parse_records(&out);
    assert!(stdout_of(&records, 1).ends_with(b"GET"));
}

#[tokio::test]
async fn large_bodies_fragment_in_order_behind_the_header_block() {
    setup();

    let (mut client, server) = duplex(1 << 21);
    let body: Vec<u8> = (0..70_000u32).map(|i| (i % 199) as u8).collect();
    let expected = body.clone();

    let task = tokio::spawn(Connection::<_, _, Sequential>::serve(
        server,
        Arc::new(ServerConfig::default()),
        Arc::new(move |_, response: Response| {
            let body = body.clone();
            async move { response.put(&body).await }
        }),
    ));

    let mut input = begin_request(1, false);
    input.extend_from_slice(&params(1, &[]));
    input.extend_from_slice(&record(STDIN, 1, &[]));
    client.write_all(&input).await.unwrap();

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    task.await.unwrap().unwrap();

    let records = parse_records(&out);
    // No record may exceed the protocol's content size limit.
    assert!(records.iter().all(|r| r.content.len() <= 0xffff));

    // Body bytes are contiguous, in order, and strictly after the header
    // block; EndRequest follows the final Stdout record.
    let stdout = stdout_of(&records, 1);
    let header_end = stdout
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header block terminator missing")
        + 4;
    assert!(stdout[..header_end].starts_with(b"Status: 200\r\n"));
    assert_eq!(&stdout[header_end..], &expected[..]);

    let last_stdout = records.iter().rposition(|r| r.r#type == STDOUT).unwrap();
    let end_request = records.iter().position(|r| r.r#type == END_REQUEST).unwrap();
    assert!(end_request > last_stdout);
}
