use std::{path::PathBuf, time::Duration};

use assert_matches::assert_matches;
use link_api::{
    attach_consumer, attach_producer, LinkBroker, LinkError, LinkSpec, OnFull, Signal,
};

fn broker_with(spec: LinkSpec) -> LinkBroker {
    let broker = LinkBroker::new();
    broker.register(spec).unwrap();
    broker
}

fn socket_path(test: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/link-api-{}-{}.sock", test, std::process::id()))
}

#[tokio::test]
async fn fifo_order_is_preserved() {
    let broker = broker_with(LinkSpec::simple("fifo", "P.q_out", "C.q_in", 4));
    let mut tx = broker.local_sender("fifo").unwrap();
    let mut rx = broker.local_receiver("fifo", "C.q_in").unwrap();

    let producer = tokio::spawn(async move {
        for i in 0u32..100 {
            tx.put_obj(&i).await.unwrap();
        }
    });

    for expected in 0u32..100 {
        let got: u32 = rx.get_obj().await.unwrap();
        assert_eq!(got, expected);
    }
    producer.await.unwrap();
}

#[tokio::test]
async fn nowait_reports_full_and_empty() {
    let broker = broker_with(LinkSpec::simple("bounded", "P.q_out", "C.q_in", 2));
    let mut tx = broker.local_sender("bounded").unwrap();
    let mut rx = broker.local_receiver("bounded", "C.q_in").unwrap();

    tx.put_nowait(vec![1]).await.unwrap();
    tx.put_nowait(vec![2]).await.unwrap();
    assert_matches!(
        tx.put_nowait(vec![3]).await,
        Err(LinkError::Full { .. })
    );

    assert_eq!(rx.get_nowait().await.unwrap(), vec![1]);
    assert_eq!(rx.get_nowait().await.unwrap(), vec![2]);
    assert_matches!(rx.get_nowait().await, Err(LinkError::Empty { .. }));
    assert!(rx.empty().await.unwrap());
}

#[tokio::test]
async fn get_timeout_elapses() {
    let broker = broker_with(LinkSpec::simple("idle", "P.q_out", "C.q_in", 2));
    let mut rx = broker.local_receiver("idle", "C.q_in").unwrap();
    assert_matches!(
        rx.get_timeout(Duration::from_millis(20)).await,
        Err(LinkError::Timeout { .. })
    );
}

#[tokio::test]
async fn fan_out_delivers_exactly_once_in_order() {
    let sinks = vec!["B.q_in".to_string(), "C.q_in".to_string()];
    let broker = broker_with(LinkSpec::fan_out(
        "spread",
        "A.q_out",
        &sinks,
        16,
        OnFull::Block,
    ));
    let mut tx = broker.local_sender("spread").unwrap();
    let mut rx_b = broker.local_receiver("spread", "B.q_in").unwrap();
    let mut rx_c = broker.local_receiver("spread", "C.q_in").unwrap();

    for i in 0u32..10 {
        tx.put_obj(&i).await.unwrap();
    }

    for expected in 0u32..10 {
        let b: u32 = rx_b.get_obj().await.unwrap();
        let c: u32 = rx_c.get_obj().await.unwrap();
        assert_eq!(b, expected);
        assert_eq!(c, expected);
    }
    assert!(rx_b.empty().await.unwrap());
    assert!(rx_c.empty().await.unwrap());
}

#[tokio::test]
async fn drop_policy_loses_items_only_at_full_sinks() {
    // sink order matters: "stuck" is attempted before "live", so once
    // "live" has an item the forwarder is done with that item everywhere
    let sinks = vec!["stuck.q_in".to_string(), "live.q_in".to_string()];
    let broker = broker_with(LinkSpec::fan_out(
        "lossy",
        "A.q_out",
        &sinks,
        1,
        OnFull::Drop,
    ));
    let mut tx = broker.local_sender("lossy").unwrap();
    let mut rx_live = broker.local_receiver("lossy", "live.q_in").unwrap();

    tx.put_obj(&1u32).await.unwrap();
    assert_eq!(rx_live.get_obj::<u32>().await.unwrap(), 1);
    tx.put_obj(&2u32).await.unwrap();
    assert_eq!(rx_live.get_obj::<u32>().await.unwrap(), 2);

    // the stuck sink kept the first item and dropped the second
    let mut rx_stuck = broker.local_receiver("lossy", "stuck.q_in").unwrap();
    assert_eq!(rx_stuck.get_obj::<u32>().await.unwrap(), 1);
    assert_matches!(rx_stuck.get_nowait().await, Err(LinkError::Empty { .. }));
}

#[tokio::test]
async fn closed_link_drains_then_reports_closed() {
    let broker = broker_with(LinkSpec::simple("ending", "P.q_out", "C.q_in", 4));
    let mut tx = broker.local_sender("ending").unwrap();
    let mut rx = broker.local_receiver("ending", "C.q_in").unwrap();

    tx.put_nowait(vec![9]).await.unwrap();
    drop(tx);
    broker.close_link("ending");

    assert_eq!(rx.get_nowait().await.unwrap(), vec![9]);
    assert_matches!(rx.get_nowait().await, Err(LinkError::Closed { .. }));
    assert_matches!(
        broker.local_sender("ending"),
        Err(LinkError::Closed { .. })
    );
}

#[tokio::test]
async fn duplicate_registration_is_refused() {
    let broker = broker_with(LinkSpec::simple("dup", "P.q_out", "C.q_in", 4));
    assert_matches!(
        broker.register(LinkSpec::simple("dup", "X.q_out", "Y.q_in", 4)),
        Err(LinkError::Duplicate { .. })
    );
}

#[tokio::test]
async fn remote_endpoints_roundtrip_over_the_socket() {
    let path = socket_path("roundtrip");
    let broker = broker_with(LinkSpec::simple("wire", "P.q_out", "C.q_in", 4));
    broker.serve(&path).await.unwrap();

    let mut tx = attach_producer(&path, "wire").await.unwrap();
    let mut rx = attach_consumer(&path, "wire", "C.q_in").await.unwrap();

    tx.put_obj(&Signal::Ready).await.unwrap();
    let signal: Signal = rx.get_obj().await.unwrap();
    assert_eq!(signal, Signal::Ready);

    assert!(rx.empty().await.unwrap());
    assert_matches!(rx.get_nowait().await, Err(LinkError::Empty { .. }));
    assert_matches!(
        rx.get_timeout(Duration::from_millis(20)).await,
        Err(LinkError::Timeout { .. })
    );

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn sink_allows_exactly_one_reader() {
    let path = socket_path("single-reader");
    let broker = broker_with(LinkSpec::simple("solo", "P.q_out", "C.q_in", 4));
    broker.serve(&path).await.unwrap();

    let first = attach_consumer(&path, "solo", "C.q_in").await.unwrap();
    assert_matches!(
        attach_consumer(&path, "solo", "C.q_in").await,
        Err(LinkError::Refused { .. })
    );

    // detaching hands the queue back for a successor (the revive path)
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    attach_consumer(&path, "solo", "C.q_in").await.unwrap();

    let _ = std::fs::remove_file(&path);
}
