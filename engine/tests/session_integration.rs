// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! End-to-end scenarios combining the broker, the HTTP file server and the
//! session orchestrator against a small in-process stand-in for the printer
//! firmware.

use std::net::SocketAddr;
use std::time::Duration;

use codec::{
    ByteArray, Cmd, CommandData, CommandEnvelope, ConnectAckPacket, ConnectPacket, DecodePacket,
    EncodePacket, PublishPacket, QoS, SubscribeAckPacket, SubscribePacket,
};
use sdcp_engine::{Broker, HttpServer, PrinterDescriptor, Session, SessionConfig, StatusSnapshot};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const MAINBOARD: &str = "MB1";

async fn write_packet<P: EncodePacket>(write_half: &mut OwnedWriteHalf, packet: &P) {
    let mut buf = Vec::new();
    packet.encode(&mut buf).unwrap();
    write_half.write_all(&buf).await.unwrap();
}

async fn read_packet<P: DecodePacket>(stream: &mut TcpStream) -> P {
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap();
    let mut ba = ByteArray::new(&buf[..n]);
    P::decode(&mut ba).unwrap()
}

/// Dials `broker_addr`, completes CONNECT/SUBSCRIBE as `MB1`, and returns a
/// channel of decoded request envelopes plus the write half to reply with.
async fn spawn_fake_printer(
    broker_addr: SocketAddr,
) -> (mpsc::UnboundedReceiver<CommandEnvelope>, OwnedWriteHalf) {
    let mut stream = TcpStream::connect(broker_addr).await.unwrap();

    let connect = ConnectPacket::new(MAINBOARD).unwrap();
    let mut buf = Vec::new();
    connect.encode(&mut buf).unwrap();
    stream.write_all(&buf).await.unwrap();
    let _ack: ConnectAckPacket = read_packet(&mut stream).await;

    let subscribe =
        SubscribePacket::new(&format!("/sdcp/request/{MAINBOARD}"), QoS::AtMostOnce, 1).unwrap();
    let mut buf = Vec::new();
    subscribe.encode(&mut buf).unwrap();
    stream.write_all(&buf).await.unwrap();
    let _suback: SubscribeAckPacket = read_packet(&mut stream).await;

    let (mut read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let mut ba = ByteArray::new(&buf[..n]);
            let Ok(packet) = PublishPacket::decode(&mut ba) else {
                continue;
            };
            let Ok(envelope) = CommandEnvelope::from_json(&String::from_utf8_lossy(packet.payload()))
            else {
                continue;
            };
            if tx.send(envelope).is_err() {
                break;
            }
        }
    });

    (rx, write_half)
}

async fn reply_ack(write_half: &mut OwnedWriteHalf, envelope: &CommandEnvelope) {
    let reply = CommandEnvelope {
        id: envelope.id.clone(),
        data: codec::EnvelopeData {
            cmd: envelope.data.cmd,
            data: CommandData::ack(0),
            from: 1,
            mainboard_id: envelope.data.mainboard_id.clone(),
            request_id: envelope.data.request_id.clone(),
            time_stamp: envelope.data.time_stamp,
        },
    };
    let payload = reply.to_json().unwrap();
    let packet = PublishPacket::new(&format!("/sdcp/response/{MAINBOARD}"), 1, payload.as_bytes()).unwrap();
    write_packet(write_half, &packet).await;
}

/// Wraps a bare `{"CurrentStatus":...}` style snapshot in the envelope shape
/// a real status push carries: `{"Id":...,"Data":{"Status":{...}}}`.
async fn push_status(write_half: &mut OwnedWriteHalf, status_json: &str) {
    let payload = format!(r#"{{"Id":"status","Data":{{"Status":{status_json}}}}}"#);
    let packet = PublishPacket::new(&format!("/sdcp/status/{MAINBOARD}"), 1, payload.as_bytes()).unwrap();
    write_packet(write_half, &packet).await;
}

/// Drains and acks the three priming commands `Session::connect` always
/// sends (`NOP_0`, `NOP_1`, `SET_REPORT_PERIOD`) before the test proceeds
/// to drive the session under test.
async fn drain_priming_sequence(
    requests: &mut mpsc::UnboundedReceiver<CommandEnvelope>,
    write_half: &mut OwnedWriteHalf,
) {
    for _ in 0..3 {
        let envelope = requests.recv().await.unwrap();
        reply_ack(write_half, &envelope).await;
    }
}

#[tokio::test]
async fn test_command_round_trip() {
    let _ = env_logger::try_init();
    let broker = Broker::bind("127.0.0.1:0").await.unwrap();
    let broker_addr = broker.local_addr();
    let (to_session, from_broker) = mpsc::channel(16);
    let (to_broker, from_session) = mpsc::channel(16);
    tokio::spawn(broker.run(to_session, from_session));

    let http = HttpServer::bind("127.0.0.1:0").await.unwrap();
    let http_port = http.local_addr().port();
    let route_handle = http.route_handle();
    tokio::spawn(http.run());

    let descriptor = PrinterDescriptor {
        id: "abc".to_string(),
        address: SocketAddr::from(([127, 0, 0, 1], 0)),
        mainboard_id: MAINBOARD.to_string(),
        name: "Saturn".to_string(),
        machine_name: "Saturn 3".to_string(),
        status: StatusSnapshot::default(),
    };

    let fake_printer = tokio::spawn(spawn_fake_printer(broker_addr));
    let connect = tokio::spawn(Session::connect(
        descriptor,
        broker_addr.port(),
        from_broker,
        to_broker,
        route_handle,
        http_port,
        SessionConfig::default(),
    ));

    let (mut requests, mut write_half) = fake_printer.await.unwrap();
    drain_priming_sequence(&mut requests, &mut write_half).await;
    let handle = connect.await.unwrap().unwrap();

    let submit = tokio::spawn({
        let handle = handle.clone();
        async move { handle.submit(Cmd::Nop0, CommandData::default()).await }
    });

    let envelope = requests.recv().await.unwrap();
    assert_eq!(envelope.data.cmd, Cmd::Nop0);
    reply_ack(&mut write_half, &envelope).await;

    let result = submit.await.unwrap().unwrap();
    assert_eq!(result.data.ack_value(), Some(0));
}

#[tokio::test]
async fn test_upload_progress_success() {
    let _ = env_logger::try_init();
    let broker = Broker::bind("127.0.0.1:0").await.unwrap();
    let broker_addr = broker.local_addr();
    let (to_session, from_broker) = mpsc::channel(16);
    let (to_broker, from_session) = mpsc::channel(16);
    tokio::spawn(broker.run(to_session, from_session));

    let http = HttpServer::bind("127.0.0.1:0").await.unwrap();
    let http_port = http.local_addr().port();
    let route_handle = http.route_handle();
    tokio::spawn(http.run());

    let descriptor = PrinterDescriptor {
        id: "abc".to_string(),
        address: SocketAddr::from(([127, 0, 0, 1], 0)),
        mainboard_id: MAINBOARD.to_string(),
        name: "Saturn".to_string(),
        machine_name: "Saturn 3".to_string(),
        status: StatusSnapshot::default(),
    };

    let fake_printer = tokio::spawn(spawn_fake_printer(broker_addr));
    let connect = tokio::spawn(Session::connect(
        descriptor,
        broker_addr.port(),
        from_broker,
        to_broker,
        route_handle,
        http_port,
        SessionConfig::default(),
    ));
    let (mut requests, mut write_half) = fake_printer.await.unwrap();
    drain_priming_sequence(&mut requests, &mut write_half).await;
    let handle = connect.await.unwrap().unwrap();

    let file_path = std::env::temp_dir().join("sdcp_engine_session_test_upload.ctb");
    std::fs::write(&file_path, vec![0u8; 1000]).unwrap();

    let upload = tokio::spawn({
        let handle = handle.clone();
        let file_path = file_path.clone();
        async move { handle.upload(&file_path, false).await }
    });

    let envelope = requests.recv().await.unwrap();
    assert_eq!(envelope.data.cmd, Cmd::UploadFile);
    let upload_file = envelope.data.data.upload_file().unwrap();
    assert!(upload_file.url.contains("${ipaddr}"));
    reply_ack(&mut write_half, &envelope).await;

    let mut progress = upload.await.unwrap().unwrap();

    push_status(
        &mut write_half,
        r#"{"CurrentStatus":1,"PrintInfo":{"Status":0,"CurrentLayer":0,"TotalLayer":0,"Filename":""},"FileTransferInfo":{"Status":1,"DownloadOffset":250,"FileTotalSize":1000,"Filename":"a.ctb"}}"#,
    )
    .await;
    let step1 = progress.recv().await.unwrap();
    assert_eq!((step1.offset, step1.total), (250, 1000));

    push_status(
        &mut write_half,
        r#"{"CurrentStatus":1,"PrintInfo":{"Status":0,"CurrentLayer":0,"TotalLayer":0,"Filename":""},"FileTransferInfo":{"Status":1,"DownloadOffset":750,"FileTotalSize":1000,"Filename":"a.ctb"}}"#,
    )
    .await;
    let step2 = progress.recv().await.unwrap();
    assert_eq!((step2.offset, step2.total), (750, 1000));

    push_status(
        &mut write_half,
        r#"{"CurrentStatus":0,"PrintInfo":{"Status":0,"CurrentLayer":0,"TotalLayer":0,"Filename":""},"FileTransferInfo":{"Status":2,"DownloadOffset":1000,"FileTotalSize":1000,"Filename":"a.ctb"}}"#,
    )
    .await;
    let step3 = progress.recv().await.unwrap();
    assert_eq!((step3.offset, step3.total), (1000, 1000));

    assert!(progress.recv().await.is_none());
}

#[tokio::test]
async fn test_upload_progress_failure_unregisters_route() {
    let _ = env_logger::try_init();
    let broker = Broker::bind("127.0.0.1:0").await.unwrap();
    let broker_addr = broker.local_addr();
    let (to_session, from_broker) = mpsc::channel(16);
    let (to_broker, from_session) = mpsc::channel(16);
    tokio::spawn(broker.run(to_session, from_session));

    let http = HttpServer::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http.local_addr();
    let http_port = http_addr.port();
    let route_handle = http.route_handle();
    tokio::spawn(http.run());

    let descriptor = PrinterDescriptor {
        id: "abc".to_string(),
        address: SocketAddr::from(([127, 0, 0, 1], 0)),
        mainboard_id: MAINBOARD.to_string(),
        name: "Saturn".to_string(),
        machine_name: "Saturn 3".to_string(),
        status: StatusSnapshot::default(),
    };

    let fake_printer = tokio::spawn(spawn_fake_printer(broker_addr));
    let connect = tokio::spawn(Session::connect(
        descriptor,
        broker_addr.port(),
        from_broker,
        to_broker,
        route_handle,
        http_port,
        SessionConfig::default(),
    ));
    let (mut requests, mut write_half) = fake_printer.await.unwrap();
    drain_priming_sequence(&mut requests, &mut write_half).await;
    let handle = connect.await.unwrap().unwrap();

    let file_path = std::env::temp_dir().join("sdcp_engine_session_test_upload_fail.ctb");
    std::fs::write(&file_path, vec![0u8; 1000]).unwrap();

    let upload = tokio::spawn({
        let handle = handle.clone();
        let file_path = file_path.clone();
        async move { handle.upload(&file_path, false).await }
    });

    let envelope = requests.recv().await.unwrap();
    let upload_url = envelope.data.data.upload_file().unwrap().url.clone();
    let after_scheme = upload_url.splitn(2, "://").nth(1).unwrap();
    let url_path = format!("/{}", after_scheme.splitn(2, '/').nth(1).unwrap());
    reply_ack(&mut write_half, &envelope).await;
    let mut progress = upload.await.unwrap().unwrap();

    push_status(
        &mut write_half,
        r#"{"CurrentStatus":0,"PrintInfo":{"Status":0,"CurrentLayer":0,"TotalLayer":0,"Filename":""},"FileTransferInfo":{"Status":3,"DownloadOffset":0,"FileTotalSize":1000,"Filename":"a.ctb"}}"#,
    )
    .await;
    let failure = progress.recv().await.unwrap();
    assert_eq!(failure.offset, -1);
    assert_eq!(failure.total, 1000);

    // Give the orchestrator a beat to unregister the route, then confirm a
    // GET on it 404s rather than serving the file.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut client = TcpStream::connect(http_addr).await.unwrap();
    client
        .write_all(format!("GET {url_path} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 404"));
}
