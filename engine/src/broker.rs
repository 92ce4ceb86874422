// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! A minimal MQTT 3.1.1 broker serving exactly one connected client at a
//! time. There is no listener/dispatcher/session-registry layering here —
//! one TCP connection, one subscription table, one packet id counter.

use std::collections::HashMap;
use std::net::SocketAddr;

use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodePacket, DisconnectPacket,
    EncodePacket, FixedHeader, PacketId, PacketType, PublishAckPacket, PublishPacket, QoS,
    SubscribeAck, SubscribeAckPacket, SubscribePacket,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::commands::{BrokerToSessionCmd, SessionToBrokerCmd};
use crate::error::{Error, ErrorKind};

pub struct Broker {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Broker {
    /// # Errors
    ///
    /// Returns error if `addr` cannot be bound.
    pub async fn bind(addr: &str) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections forever, serving one client at a time. A new
    /// incoming TCP connection while one is already active replaces it:
    /// the active connection is torn down and the new one takes over.
    ///
    /// # Errors
    ///
    /// Returns error if the listener itself fails (not if an individual
    /// connection fails; those are logged and the broker keeps accepting).
    pub async fn run(
        self,
        to_session: mpsc::Sender<BrokerToSessionCmd>,
        mut from_session: mpsc::Receiver<SessionToBrokerCmd>,
    ) -> Result<(), Error> {
        let mut pending = None;
        loop {
            let (stream, peer) = match pending.take() {
                Some(p) => p,
                None => self.listener.accept().await?,
            };
            log::info!("accepted connection from {peer}");
            pending =
                Self::handle_connection(stream, &self.listener, &to_session, &mut from_session)
                    .await;
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        listener: &TcpListener,
        to_session: &mpsc::Sender<BrokerToSessionCmd>,
        from_session: &mut mpsc::Receiver<SessionToBrokerCmd>,
    ) -> Option<(TcpStream, SocketAddr)> {
        let mut conn = Connection::new(stream);
        let mut buf = Vec::with_capacity(512);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((new_stream, peer)) => {
                            log::warn!("new connection from {peer} replacing the active one");
                            let _ = to_session.send(BrokerToSessionCmd::Disconnected).await;
                            return Some((new_stream, peer));
                        }
                        Err(err) => {
                            log::error!("accept() failed: {err}");
                            continue;
                        }
                    }
                }
                result = conn.stream.read_buf(&mut buf) => {
                    match result {
                        Ok(0) => {
                            log::info!("connection closed by peer");
                            let _ = to_session.send(BrokerToSessionCmd::Disconnected).await;
                            return None;
                        }
                        Ok(_n) => {
                            if let Err(err) = conn.handle_bytes(&buf, to_session).await {
                                log::warn!("handle_bytes() failed: {err}");
                                let _ = to_session.send(BrokerToSessionCmd::Disconnected).await;
                                return None;
                            }
                            buf.clear();
                        }
                        Err(err) => {
                            log::warn!("socket read failed: {err}");
                            let _ = to_session.send(BrokerToSessionCmd::Disconnected).await;
                            return None;
                        }
                    }
                }
                Some(cmd) = from_session.recv() => {
                    match cmd {
                        SessionToBrokerCmd::Publish(packet) => {
                            if let Err(err) = conn.publish(packet).await {
                                log::warn!("failed to forward publish to client: {err}");
                            }
                        }
                        SessionToBrokerCmd::Disconnect => {
                            let _ = conn.stream.shutdown().await;
                            return None;
                        }
                    }
                }
            }
        }
    }
}

/// Per-connection state: the socket, the client id negotiated at CONNECT,
/// the subscription table, and the monotonic packet id counter used for
/// outbound PUBLISH.
struct Connection {
    stream: TcpStream,
    client_id: String,
    subscriptions: HashMap<String, QoS>,
    next_packet_id: u16,
}

impl Connection {
    const fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            client_id: String::new(),
            subscriptions: HashMap::new(),
            next_packet_id: 1,
        }
    }

    async fn send<P: EncodePacket>(&mut self, packet: &P) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    fn next_packet_id(&mut self) -> PacketId {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        PacketId::new(id)
    }

    /// Decodes exactly one packet out of `buf` and dispatches it. This
    /// subset assumes one TCP read carries one packet, matching the
    /// framing this broker's clients actually produce.
    async fn handle_bytes(
        &mut self,
        buf: &[u8],
        to_session: &mpsc::Sender<BrokerToSessionCmd>,
    ) -> Result<(), Error> {
        let mut peek = ByteArray::new(buf);
        let fixed_header = FixedHeader::decode(&mut peek)?;

        match fixed_header.packet_type() {
            PacketType::Connect => self.handle_connect(buf, to_session).await,
            PacketType::Publish { .. } => self.handle_publish(buf, to_session).await,
            PacketType::Subscribe => self.handle_subscribe(buf, to_session).await,
            PacketType::Disconnect => self.handle_disconnect(buf, to_session).await,
            PacketType::PublishAck => {
                let mut ba = ByteArray::new(buf);
                let _ = codec::PublishAckPacket::decode(&mut ba)?;
                Ok(())
            }
            t => Err(Error::new(
                ErrorKind::ProtocolError,
                &format!("unexpected packet type in this position: {t:?}"),
            )),
        }
    }

    async fn handle_connect(
        &mut self,
        buf: &[u8],
        to_session: &mpsc::Sender<BrokerToSessionCmd>,
    ) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = ConnectPacket::decode(&mut ba)?;
        self.client_id = packet.client_id().to_string();
        let ack = ConnectAckPacket::new(false, ConnectReturnCode::Accepted);
        self.send(&ack).await?;
        to_session
            .send(BrokerToSessionCmd::Connected(self.client_id.clone()))
            .await?;
        Ok(())
    }

    async fn handle_publish(
        &mut self,
        buf: &[u8],
        to_session: &mpsc::Sender<BrokerToSessionCmd>,
    ) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = PublishPacket::decode(&mut ba)?;
        if packet.qos() != QoS::AtMostOnce {
            let ack = PublishAckPacket::new(packet.packet_id());
            self.send(&ack).await?;
        }
        to_session
            .send(BrokerToSessionCmd::Publish(packet))
            .await?;
        Ok(())
    }

    async fn handle_subscribe(
        &mut self,
        buf: &[u8],
        to_session: &mpsc::Sender<BrokerToSessionCmd>,
    ) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = SubscribePacket::decode(&mut ba)?;
        self.subscriptions
            .insert(packet.topic().to_string(), packet.qos());
        let ack = SubscribeAckPacket::new(packet.packet_id(), SubscribeAck::Granted(packet.qos()));
        self.send(&ack).await?;
        to_session
            .send(BrokerToSessionCmd::Subscribed(packet.topic().to_string()))
            .await?;
        Ok(())
    }

    async fn handle_disconnect(
        &mut self,
        buf: &[u8],
        to_session: &mpsc::Sender<BrokerToSessionCmd>,
    ) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let _ = DisconnectPacket::decode(&mut ba)?;
        to_session.send(BrokerToSessionCmd::Disconnected).await?;
        Ok(())
    }

    /// Serialize and send an outbound PUBLISH if the client is subscribed
    /// to its topic, assigning a fresh monotonic packet id; otherwise drop
    /// with a debug log.
    async fn publish(&mut self, packet: PublishPacket) -> Result<(), Error> {
        if !self.subscriptions.contains_key(packet.topic()) {
            log::debug!("dropping publish on unsubscribed topic {}", packet.topic());
            return Ok(());
        }
        let packet_id = self.next_packet_id();
        let outbound = PublishPacket::new(packet.topic(), packet_id.value(), packet.payload())?;
        self.send(&outbound).await
    }
}
