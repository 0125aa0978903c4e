//! End-to-end tests driving the client and server roles against each
//! other over in-memory transport pairs, one per framing variant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use voltage_modbus_stack::protocol::data_utils;
use voltage_modbus_stack::{
    DeviceIdCode, MemoryTransport, ModbusClient, ModbusError, ModbusRegisterBank, ModbusServer,
    ModbusTransport, ServerIdentity, ServerModel, TransportEvent,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Spawn a serving Modbus server over one end of a memory pair.
async fn spawn_server(mut server: ModbusServer<MemoryTransport>) {
    server.open().await.unwrap();
    tokio::spawn(async move {
        let _ = server.serve().await;
    });
}

#[tokio::test]
async fn test_rtu_read_holding_registers_round_trip() {
    init_logging();
    let (client_transport, server_transport) = MemoryTransport::pair();

    let bank = Arc::new(ModbusRegisterBank::new());
    bank.write_multiple_registers(0x006B, &[0xAE41, 0x5652, 0x4340])
        .unwrap();

    let server = ModbusServer::rtu(server_transport);
    server.add(bank.clone().model(17)).unwrap();
    spawn_server(server).await;

    let mut client = ModbusClient::rtu(client_transport);
    client.open().await.unwrap();

    let values = client.read_holding_registers(17, 0x006B, 3).await.unwrap();
    assert_eq!(values, vec![0xAE41, 0x5652, 0x4340]);
}

#[tokio::test]
async fn test_ascii_read_coils_round_trip() {
    init_logging();
    let (client_transport, server_transport) = MemoryTransport::pair();

    let pattern = data_utils::unpack_bits(&[0xCD, 0x6B, 0x05], 19);
    let expected = pattern.clone();
    let model = ServerModel::new(11).on_read_coils(move |address, quantity| {
        let pattern = pattern.clone();
        async move {
            assert_eq!(address, 0x0013);
            Ok(pattern[..quantity as usize].to_vec())
        }
    });

    let server = ModbusServer::ascii(server_transport);
    server.add(model).unwrap();
    spawn_server(server).await;

    let mut client = ModbusClient::ascii(client_transport);
    client.open().await.unwrap();

    let bits = client.read_coils(11, 0x0013, 19).await.unwrap();
    assert_eq!(bits, expected);
    assert_eq!(
        bits[..8],
        [true, false, true, true, false, false, true, true]
    );
}

#[tokio::test]
async fn test_mbap_broadcast_reaches_every_model_without_response() {
    init_logging();
    let (client_transport, server_transport) = MemoryTransport::pair();

    let bank_a = Arc::new(ModbusRegisterBank::new());
    let bank_b = Arc::new(ModbusRegisterBank::new());

    let server = ModbusServer::tcp(server_transport);
    server.add(bank_a.clone().model(1)).unwrap();
    server.add(bank_b.clone().model(2)).unwrap();
    spawn_server(server).await;

    let mut client = ModbusClient::tcp(client_transport);
    client.open().await.unwrap();

    // Broadcast completes without waiting for any reply.
    client
        .write_multiple_registers(0, 0x0001, &[0x000A, 0x0102])
        .await
        .unwrap();

    // Give the server a moment to run both dispatches.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(
        bank_a.read_holding_registers(1, 2).unwrap(),
        vec![0x000A, 0x0102]
    );
    assert_eq!(
        bank_b.read_holding_registers(1, 2).unwrap(),
        vec![0x000A, 0x0102]
    );

    // No stray broadcast response is sitting in the stream: the next
    // unicast request correlates cleanly.
    let values = client.read_holding_registers(1, 0x0001, 2).await.unwrap();
    assert_eq!(values, vec![0x000A, 0x0102]);
}

#[tokio::test]
async fn test_server_synthesizes_illegal_function_exception() {
    init_logging();
    let (client_transport, server_transport) = MemoryTransport::pair();

    // The model only reads coils; holding registers are not implemented.
    let model = ServerModel::new(17).on_read_coils(|_, quantity| async move {
        Ok(vec![false; quantity as usize])
    });
    let server = ModbusServer::rtu(server_transport);
    server.add(model).unwrap();
    spawn_server(server).await;

    let mut client = ModbusClient::rtu(client_transport);
    client.open().await.unwrap();

    let err = client
        .read_holding_registers(17, 0x0000, 1)
        .await
        .unwrap_err();
    match err {
        ModbusError::Exception { function, code, .. } => {
            assert_eq!(function, 0x03);
            assert_eq!(code, 0x01);
        }
        other => panic!("expected exception, got {other}"),
    }
}

#[tokio::test]
async fn test_client_times_out_and_releases_wait_slot() {
    init_logging();
    let (client_transport, peer) = MemoryTransport::pair();
    // The peer never answers; keep it alive so writes still flush.
    let _peer = peer;

    let mut client = ModbusClient::tcp(client_transport);
    client.set_request_timeout(Duration::from_millis(50));
    client.open().await.unwrap();

    let err = client.read_holding_registers(1, 0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::Timeout { .. }));
    assert!(format!("{err}").starts_with("Timeout"));

    // The wait slot is free again: a second request fails the same way
    // instead of tripping the single-wait invariant.
    let err = client.read_holding_registers(1, 0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::Timeout { .. }));
}

#[tokio::test]
async fn test_rtu_client_recovers_from_split_response() {
    init_logging();
    let (client_transport, mut peer) = MemoryTransport::pair();
    peer.open().await.unwrap();

    // A scripted peer that answers the FC3 request in two bursts with a
    // pause between them.
    tokio::spawn(async move {
        match peer.recv().await {
            TransportEvent::Data { reply, .. } => {
                let response = [0x11, 0x03, 0x06, 0xAE, 0x41, 0x56, 0x52, 0x43, 0x40, 0x49, 0xAD];
                reply.send(bytes::Bytes::copy_from_slice(&response[..4]));
                sleep(Duration::from_millis(20)).await;
                reply.send(bytes::Bytes::copy_from_slice(&response[4..]));
            }
            _ => panic!("expected request"),
        }
    });

    let mut client = ModbusClient::rtu(client_transport);
    client.open().await.unwrap();

    let values = client.read_holding_registers(17, 0x006B, 3).await.unwrap();
    assert_eq!(values, vec![0xAE41, 0x5652, 0x4340]);
}

#[tokio::test]
async fn test_write_single_coil_echo_round_trip() {
    init_logging();
    let (client_transport, server_transport) = MemoryTransport::pair();

    let bank = Arc::new(ModbusRegisterBank::new());
    let server = ModbusServer::tcp(server_transport);
    server.add(bank.clone().model(1)).unwrap();
    spawn_server(server).await;

    let mut client = ModbusClient::tcp(client_transport);
    client.open().await.unwrap();

    client.write_single_coil(1, 0x00AC, true).await.unwrap();
    assert_eq!(bank.read_coils(0x00AC, 1).unwrap(), vec![true]);

    client.write_single_coil(1, 0x00AC, false).await.unwrap();
    assert_eq!(bank.read_coils(0x00AC, 1).unwrap(), vec![false]);
}

#[tokio::test]
async fn test_read_write_multiple_registers_round_trip() {
    init_logging();
    let (client_transport, server_transport) = MemoryTransport::pair();

    let bank = Arc::new(ModbusRegisterBank::new());
    bank.write_multiple_registers(0x0010, &[0x1111, 0x2222])
        .unwrap();

    let server = ModbusServer::tcp(server_transport);
    server.add(bank.clone().model(1)).unwrap();
    spawn_server(server).await;

    let mut client = ModbusClient::tcp(client_transport);
    client.open().await.unwrap();

    // Write [0xBEEF] at 0x0010, then read two registers back from the
    // same address: the read happens after the write.
    let values = client
        .read_write_multiple_registers(1, 0x0010, 2, 0x0010, &[0xBEEF])
        .await
        .unwrap();
    assert_eq!(values, vec![0xBEEF, 0x2222]);
}

#[tokio::test]
async fn test_report_server_id_round_trip() {
    init_logging();
    let (client_transport, server_transport) = MemoryTransport::pair();

    let model = ServerModel::new(5).on_report_server_id(|| async {
        Ok(ServerIdentity {
            server_id: 0x42,
            running: true,
            additional: vec![0x01, 0x02, 0x03],
        })
    });
    let server = ModbusServer::ascii(server_transport);
    server.add(model).unwrap();
    spawn_server(server).await;

    let mut client = ModbusClient::ascii(client_transport);
    client.open().await.unwrap();

    let identity = client.report_server_id(5).await.unwrap();
    assert_eq!(identity.server_id, 0x42);
    assert!(identity.running);
    assert_eq!(identity.additional, vec![0x01, 0x02, 0x03]);
}

#[tokio::test]
async fn test_device_identification_round_trip() {
    init_logging();
    let (client_transport, server_transport) = MemoryTransport::pair();

    let model = ServerModel::new(9).on_read_device_identification(|| async {
        Ok(HashMap::from([
            (0x00u8, "Voltage Energy".to_string()),
            (0x01u8, "VMS-1".to_string()),
            (0x02u8, "0.1.0".to_string()),
        ]))
    });
    let server = ModbusServer::tcp(server_transport);
    server.add(model).unwrap();
    spawn_server(server).await;

    let mut client = ModbusClient::tcp(client_transport);
    client.open().await.unwrap();

    let identification = client
        .read_device_identification(9, DeviceIdCode::Basic, 0x00)
        .await
        .unwrap();
    assert_eq!(identification.conformity_level, 0x81);
    assert!(!identification.more_follows);
    assert_eq!(
        identification.objects.get(&0x00).map(String::as_str),
        Some("Voltage Energy")
    );
    assert_eq!(
        identification.objects.get(&0x01).map(String::as_str),
        Some("VMS-1")
    );
    assert_eq!(
        identification.objects.get(&0x02).map(String::as_str),
        Some("0.1.0")
    );
}

#[tokio::test]
async fn test_mask_write_register_round_trip() {
    init_logging();
    let (client_transport, server_transport) = MemoryTransport::pair();

    let bank = Arc::new(ModbusRegisterBank::new());
    bank.write_single_register(4, 0x0012).unwrap();

    let server = ModbusServer::tcp(server_transport);
    server.add(bank.clone().model(1)).unwrap();
    spawn_server(server).await;

    let mut client = ModbusClient::tcp(client_transport);
    client.open().await.unwrap();

    client
        .mask_write_register(1, 0x0004, 0x00F2, 0x0025)
        .await
        .unwrap();
    assert_eq!(bank.read_holding_registers(4, 1).unwrap(), vec![0x0017]);
}

#[tokio::test]
async fn test_requests_for_unregistered_units_are_ignored() {
    init_logging();
    let (client_transport, server_transport) = MemoryTransport::pair();

    let bank = Arc::new(ModbusRegisterBank::new());
    let server = ModbusServer::tcp(server_transport);
    server.add(bank.clone().model(1)).unwrap();
    spawn_server(server).await;

    let mut client = ModbusClient::tcp(client_transport);
    client.set_request_timeout(Duration::from_millis(50));
    client.open().await.unwrap();

    // Unit 9 is not registered: the server stays silent and the client
    // times out.
    let err = client.read_holding_registers(9, 0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::Timeout { .. }));

    // The registered unit still answers afterwards.
    client.set_request_timeout(Duration::from_millis(1000));
    let values = client.read_holding_registers(1, 0, 1).await.unwrap();
    assert_eq!(values, vec![0]);
}

#[tokio::test]
async fn test_model_add_and_remove_at_runtime() {
    init_logging();
    let (client_transport, server_transport) = MemoryTransport::pair();

    let bank = Arc::new(ModbusRegisterBank::new());
    let server = ModbusServer::tcp(server_transport);
    let models = server.models();
    spawn_server(server).await;

    let mut client = ModbusClient::tcp(client_transport);
    client.set_request_timeout(Duration::from_millis(50));
    client.open().await.unwrap();

    // Nothing registered yet.
    assert!(client.read_holding_registers(1, 0, 1).await.is_err());

    models.add(bank.clone().model(1)).unwrap();
    let values = client.read_holding_registers(1, 0, 1).await.unwrap();
    assert_eq!(values, vec![0]);

    models.remove(1).unwrap();
    assert!(client.read_holding_registers(1, 0, 1).await.is_err());
}
