//! End-to-end exercises of the public engine surface (§6) against two
//! in-process engines talking over real TCP loopback sockets, mirroring
//! scenario 1 of the engine's testable properties: one side registers a
//! host region, the other registers a device region, and a `Read` moves
//! bytes from the device side into the host side.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use hixl::{EndpointDescriptor, EngineError, HixlEngine, MemType, Placement, Protocol, TransferOp, TransferOpDesc};

fn catalog(net_instance_id: u64) -> Vec<EndpointDescriptor> {
    vec![EndpointDescriptor {
        protocol: Protocol::Roce,
        placement: Placement::Host,
        comm_id: "test".to_string(),
        plane: None,
        dst_eid: None,
        net_instance_id: Some(net_instance_id),
    }]
}

fn id_for(tag: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    tag.hash(&mut hasher);
    hasher.finish()
}

async fn new_engine(tag: &str) -> std::sync::Arc<HixlEngine> {
    HixlEngine::initialize("127.0.0.1:0", catalog(id_for(tag)), HashMap::new())
        .await
        .expect("engine initializes")
}

#[tokio::test]
async fn connect_and_transfer_moves_bytes() {
    let server = new_engine("server").await;
    let client = new_engine("client").await;

    let mut server_buf = vec![2u8; 4];
    let server_addr = server_buf.as_mut_ptr() as u64;
    server
        .register_mem(server_addr, 4, MemType::Device)
        .await
        .expect("register server region");

    let mut client_buf = vec![0u8; 4];
    let client_addr = client_buf.as_mut_ptr() as u64;
    client
        .register_mem(client_addr, 4, MemType::Host)
        .await
        .expect("register client region");

    let server_name = server.local_addr().await.unwrap().to_string();
    client.connect(&server_name, 2_000).await.expect("connect succeeds");

    let descs = [TransferOpDesc {
        local_addr: client_addr,
        remote_addr: server_addr,
        len: 4,
    }];
    client
        .transfer_sync(&server_name, TransferOp::Read, &descs, 2_000)
        .await
        .expect("read completes");

    assert_eq!(client_buf, vec![2u8; 4]);

    client.disconnect(&server_name, 2_000).await.expect("disconnect succeeds");
    server.finalize().await.expect("server finalizes");
    client.finalize().await.expect("client finalizes");
}

#[tokio::test]
async fn double_connect_is_rejected() {
    let server = new_engine("server-dup").await;
    let client = new_engine("client-dup").await;
    let server_name = server.local_addr().await.unwrap().to_string();

    client.connect(&server_name, 2_000).await.expect("first connect succeeds");
    let second = client.connect(&server_name, 2_000).await;
    assert!(matches!(second, Err(EngineError::AlreadyConnected)));

    client.disconnect(&server_name, 2_000).await.unwrap();
    server.finalize().await.unwrap();
    client.finalize().await.unwrap();
}

#[tokio::test]
async fn disconnect_unknown_peer_is_not_connected() {
    let client = new_engine("lonely-client").await;
    let result = client.disconnect("127.0.0.1:1", 100).await;
    assert!(matches!(result, Err(EngineError::NotConnected)));
    client.finalize().await.unwrap();
}

#[tokio::test]
async fn transfer_async_reports_completion_then_consumes_the_handle() {
    let server = new_engine("server-async").await;
    let client = new_engine("client-async").await;

    let mut server_buf = vec![9u8; 4];
    let server_addr = server_buf.as_mut_ptr() as u64;
    server.register_mem(server_addr, 4, MemType::Device).await.unwrap();

    let mut client_buf = vec![0u8; 4];
    let client_addr = client_buf.as_mut_ptr() as u64;
    client.register_mem(client_addr, 4, MemType::Host).await.unwrap();

    let server_name = server.local_addr().await.unwrap().to_string();
    client.connect(&server_name, 2_000).await.unwrap();

    let descs = [TransferOpDesc {
        local_addr: client_addr,
        remote_addr: server_addr,
        len: 4,
    }];
    let request = client
        .transfer_async(&server_name, TransferOp::Read, &descs)
        .await
        .expect("async transfer submits");

    let mut status = client.get_transfer_status(request).await.unwrap();
    let mut attempts = 0;
    while status == hixl::TransferStatus::Waiting && attempts < 1_000 {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        status = client.get_transfer_status(request).await.unwrap();
        attempts += 1;
    }
    assert_eq!(status, hixl::TransferStatus::Completed);

    let second_query = client.get_transfer_status(request).await;
    assert!(matches!(second_query, Err(EngineError::ParamInvalid(_))));

    client.disconnect(&server_name, 2_000).await.unwrap();
    server.finalize().await.unwrap();
    client.finalize().await.unwrap();
}
