use fastcgi_server::{
    conn::{Connection, Multiplexed},
    Request, Response, ServerConfig, ServerResult,
};
use std::{future::Future, sync::Arc};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

mod common;
use common::*;

fn mux_config() -> ServerConfig {
    ServerConfig {
        multiplexing: true,
        mpxs_conns: "1".to_owned(),
        ..ServerConfig::default()
    }
}

async fn run_multiplexed<F, Fut>(
    input: Vec<u8>, handler: F,
) -> (Vec<WireRecord>, ServerResult<()>)
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ServerResult<()>> + Send + 'static,
{
    setup();

    let (mut client, server) = duplex(1 << 20);
    let task = tokio::spawn(Connection::<_, _, Multiplexed>::serve(
        server,
        Arc::new(mux_config()),
        Arc::new(handler),
    ));

    client.write_all(&input).await.unwrap();
    client.shutdown().await.unwrap();

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    (parse_records(&out), task.await.unwrap())
}

#[tokio::test]
async fn interleaved_requests_complete_independently() {
    let mut input = Vec::new();
    input.extend_from_slice(&begin_request(1, true));
    input.extend_from_slice(&begin_request(2, true));
    // Params of both requests interleave on the connection.
    input.extend_from_slice(&record(PARAMS, 1, &nv_pairs(&[("REQUEST_METHOD", "POST")])));
    input.extend_from_slice(&record(PARAMS, 2, &nv_pairs(&[("REQUEST_METHOD", "GET")])));
    input.extend_from_slice(&record(PARAMS, 1, &[]));
    input.extend_from_slice(&record(PARAMS, 2, &[]));
    // So do their bodies.
    input.extend_from_slice(&record(STDIN, 1, b"first "));
    input.extend_from_slice(&record(STDIN, 2, b"second"));
    input.extend_from_slice(&record(STDIN, 1, b"body"));
    input.extend_from_slice(&record(STDIN, 1, &[]));
    input.extend_from_slice(&record(STDIN, 2, &[]));

    let (records, result) = run_multiplexed(input, |mut request: Request, response: Response| async move {
        let body = request.stdin_mut().get_all().await?;
        let method = request.params().request_method().unwrap_or("?").to_owned();
        response
            .put_str(&format!("{} {}: ", request.id(), method))
            .await?;
        response.put(&body).await
    })
    .await;
    result.unwrap();

    assert!(stdout_of(&records, 1).ends_with(b"1 POST: first body"));
    assert!(stdout_of(&records, 2).ends_with(b"2 GET: second"));
    assert!(end_request_of(&records, 1).is_some());
    assert!(end_request_of(&records, 2).is_some());
}

#[tokio::test]
async fn records_for_unknown_ids_are_dropped() {
    let mut input = Vec::new();
    input.extend_from_slice(&record(STDIN, 99, b"nobody home"));
    input.extend_from_slice(&record(PARAMS, 98, &nv_pairs(&[("A", "1")])));
    input.extend_from_slice(&begin_request(1, true));
    input.extend_from_slice(&params(1, &[]));
    input.extend_from_slice(&record(STDIN, 1, &[]));

    let (records, result) = run_multiplexed(input, |_, response: Response| async move {
        response.put_str("served").await
    })
    .await;
    result.unwrap();

    assert!(stdout_of(&records, 1).ends_with(b"served"));
    assert!(end_request_of(&records, 1).is_some());
}

#[tokio::test]
async fn management_records_are_answered_inline() {
    let mut input = Vec::new();
    input.extend_from_slice(&record(GET_VALUES, 0, &nv_pairs(&[("FCGI_MPXS_CONNS", "")])));
    input.extend_from_slice(&record(0x42, 0, &[]));

    let (records, result) = run_multiplexed(input, |_, _| async { Ok(()) }).await;
    result.unwrap();

    assert_eq!(records[0].r#type, GET_VALUES_RESULT);
    assert_eq!(
        decode_nv_pairs(&records[0].content),
        [("FCGI_MPXS_CONNS".to_owned(), "1".to_owned())]
    );
    assert_eq!(records[1].r#type, UNKNOWN_TYPE);
    assert_eq!(records[1].content[0], 0x42);
}

#[tokio::test]
async fn abort_before_params_complete_ends_the_request() {
    let mut input = Vec::new();
    input.extend_from_slice(&begin_request(1, true));
    input.extend_from_slice(&record(PARAMS, 1, &nv_pairs(&[("A", "1")])));
    input.extend_from_slice(&record(ABORT_REQUEST, 1, &[]));

    let (records, result) = run_multiplexed(input, |_, _| async { Ok(()) }).await;
    result.unwrap();

    assert!(end_request_of(&records, 1).is_some());
    assert!(stdout_of(&records, 1).is_empty());
}

#[tokio::test]
async fn keep_connection_clear_closes_after_the_request() {
    setup();

    let (mut client, server) = duplex(1 << 16);
    let task = tokio::spawn(Connection::<_, _, Multiplexed>::serve(
        server,
        Arc::new(mux_config()),
        Arc::new(|_, response: Response| async move { response.put_str("bye").await }),
    ));

    let mut input = begin_request(1, false);
    input.extend_from_slice(&params(1, &[]));
    input.extend_from_slice(&record(STDIN, 1, &[]));
    client.write_all(&input).await.unwrap();

    // The agent shuts the connection down for sending once the request
    // completes, so this read ends without us closing anything.
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();

    let records = parse_records(&out);
    assert!(stdout_of(&records, 1).ends_with(b"bye"));
    assert!(end_request_of(&records, 1).is_some());

    client.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn duplicate_begin_request_is_dropped() {
    let mut input = Vec::new();
    input.extend_from_slice(&begin_request(1, true));
    input.extend_from_slice(&begin_request(1, true));
    input.extend_from_slice(&params(1, &[]));
    input.extend_from_slice(&record(STDIN, 1, &[]));

    let (records, result) = run_multiplexed(input, |_, response: Response| async move {
        response.put_str("once").await
    })
    .await;
    result.unwrap();

    assert!(stdout_of(&records, 1).ends_with(b"once"));
    // Exactly one EndRequest: the duplicate did not spawn a second agent.
    let ends = records
        .iter()
        .filter(|r| r.r#type == END_REQUEST && r.request_id == 1)
        .count();
    assert_eq!(ends, 1);
}
