use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use fork_interface::{BlockRef, StorageKey, StorageQueryService, StorageValue};
use fork_substrate_adapter::{RpcConfig, RpcError, SubstrateRpcService};
use jsonrpsee::server::{RpcModule, ServerBuilder, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;

const BLOCK: &str = "0xbeef";

struct Node {
    storage: BTreeMap<String, String>,
    flaky_lookups: AtomicUsize,
}

impl Node {
    fn new(entries: &[(&str, &str)]) -> Self {
        Self {
            storage: entries
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            flaky_lookups: AtomicUsize::new(0),
        }
    }

    fn flaky(self, failures: usize) -> Self {
        self.flaky_lookups.store(failures, Ordering::SeqCst);
        self
    }
}

fn check_block(at: &str) -> Result<(), ErrorObjectOwned> {
    if at == BLOCK {
        Ok(())
    } else {
        Err(ErrorObjectOwned::owned(-32602, "unknown block", None::<()>))
    }
}

async fn rpc_server(node: Node) -> (ServerHandle, SocketAddr) {
    let mut module = RpcModule::new(node);
    module
        .register_method("chain_getBlockHash", |_, _| {
            Ok::<_, ErrorObjectOwned>(Some(BLOCK))
        })
        .unwrap();
    module
        .register_method("state_getKeysPaged", |params, node: &Node| {
            let (prefix, count, start, at): (String, u32, Option<String>, String) =
                params.parse()?;
            check_block(&at)?;
            let keys: Vec<String> = node
                .storage
                .keys()
                .filter(|key| key.starts_with(&prefix))
                .filter(|key| start.as_ref().map_or(true, |start| *key > start))
                .take(count as usize)
                .cloned()
                .collect();
            Ok::<_, ErrorObjectOwned>(keys)
        })
        .unwrap();
    module
        .register_method("state_getStorage", |params, node: &Node| {
            let (key, at): (String, String) = params.parse()?;
            check_block(&at)?;
            let pending = node.flaky_lookups.load(Ordering::SeqCst);
            if pending > 0 {
                node.flaky_lookups.store(pending - 1, Ordering::SeqCst);
                return Err(ErrorObjectOwned::owned(-32000, "busy", None::<()>));
            }
            Ok(node.storage.get(&key).cloned())
        })
        .unwrap();
    module
        .register_method("state_getPairs", |params, node: &Node| {
            let (prefix, at): (String, String) = params.parse()?;
            check_block(&at)?;
            let pairs: Vec<(String, String)> = node
                .storage
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Ok::<_, ErrorObjectOwned>(pairs)
        })
        .unwrap();

    let server = ServerBuilder::default()
        .build("127.0.0.1:0")
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    (server.start(module), addr)
}

fn config(addr: SocketAddr, max_retries_per_request: u32) -> RpcConfig {
    RpcConfig {
        url: format!("http://{}", addr),
        max_retries_per_request,
        retry_base_delay_ms: 5,
        ..Default::default()
    }
}

fn service(addr: SocketAddr, max_retries_per_request: u32) -> SubstrateRpcService {
    SubstrateRpcService::new(&config(addr, max_retries_per_request)).unwrap()
}

fn node() -> Node {
    Node::new(&[
        ("0x1001", "0x01"),
        ("0x1002", "0x02"),
        ("0x1003", "0x03"),
        ("0x20", "0x04"),
    ])
}

#[tokio::test]
async fn pages_keys_from_node() {
    let (_server_handle, addr) = rpc_server(node()).await;
    let service = service(addr, 1);
    let at = service.point_in_time().await.unwrap();
    assert_eq!(at, BlockRef::new(BLOCK));

    let prefix = StorageKey::new("0x10");
    let first = service.keys_paged(&prefix, 2, None, &at).await.unwrap();
    assert_eq!(first, vec![StorageKey::new("0x1001"), StorageKey::new("0x1002")]);

    let second = service
        .keys_paged(&prefix, 2, first.last(), &at)
        .await
        .unwrap();
    assert_eq!(second, vec![StorageKey::new("0x1003")]);
}

#[tokio::test]
async fn reads_values_and_bulk_pairs() {
    let (_server_handle, addr) = rpc_server(node()).await;
    let service = service(addr, 1);
    let at = service.point_in_time().await.unwrap();

    let value = service
        .storage_value(&StorageKey::new("0x20"), &at)
        .await
        .unwrap();
    assert_eq!(value, Some(StorageValue::new("0x04")));

    let missing = service
        .storage_value(&StorageKey::new("0x30"), &at)
        .await
        .unwrap();
    assert_eq!(missing, None);

    let pairs = service
        .pairs_under_prefix(&StorageKey::new("0x10"), &at)
        .await
        .unwrap();
    assert_eq!(pairs.len(), 3);
    assert!(pairs.iter().all(|pair| pair.value.is_some()));
}

#[tokio::test]
async fn retries_transient_failures() {
    let (_server_handle, addr) = rpc_server(node().flaky(2)).await;
    let service = service(addr, 3);
    let at = service.point_in_time().await.unwrap();

    let value = service
        .storage_value(&StorageKey::new("0x1001"), &at)
        .await
        .unwrap();
    assert_eq!(value, Some(StorageValue::new("0x01")));
    // Retries are not counted as separate requests.
    assert_eq!(service.requests_sent(), 2);
}

#[tokio::test]
async fn gives_up_after_max_retries() {
    let (_server_handle, addr) = rpc_server(node().flaky(5)).await;
    let service = service(addr, 2);
    let at = service.point_in_time().await.unwrap();

    let err = service
        .storage_value(&StorageKey::new("0x1001"), &at)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Request {
            method: "state_getStorage",
            ..
        }
    ));
}

#[tokio::test]
async fn retries_back_off_between_attempts() {
    let (_server_handle, addr) = rpc_server(node().flaky(2)).await;
    let service = SubstrateRpcService::new(&RpcConfig {
        retry_base_delay_ms: 50,
        ..config(addr, 3)
    })
    .unwrap();
    let at = service.point_in_time().await.unwrap();

    let start = Instant::now();
    let value = service
        .storage_value(&StorageKey::new("0x1002"), &at)
        .await
        .unwrap();
    assert_eq!(value, Some(StorageValue::new("0x02")));
    // Nominal waits are 100ms and 200ms, each keeping at least half.
    assert!(start.elapsed() >= Duration::from_millis(150));
}
