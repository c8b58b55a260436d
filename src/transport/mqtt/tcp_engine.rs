//! MQTT 3.1.1 protocol engine over a non-blocking TCP socket, optionally TLS
//!
//! Packets are encoded and decoded with the `rumqttc` v4 codec. The engine
//! keeps an outbound byte buffer and an inbound reassembly buffer and never
//! blocks once connected. Name resolution and the TCP handshake in
//! [`TcpEngine::connect`] are blocking. The TLS handshake is not: it runs
//! through the same read and write steps as MQTT traffic, and the CONNECT
//! packet waits in the TLS session until the handshake completes.
//!
//! QoS handling is single shot: acknowledgements are sent and processed, but
//! unacknowledged packets are not retransmitted and nothing is persisted.

use super::engine::{EngineCallbacks, EngineError, LogLevel, Message, ProtocolEngine};
use super::tls::{self, tls_error};
use crate::session::{qos_to_u8, TlsSettings, Will};
use bytes::{Buf, Bytes, BytesMut};
use rumqttc::mqttbytes::v4::{
    read as read_packet, Connect, Disconnect, LastWill, Packet, PingReq, PubAck, PubComp, PubRec,
    PubRel, Publish, Subscribe, SubscribeReasonCode, Unsubscribe,
};
use rumqttc::mqttbytes::Error as CodecError;
use rumqttc::QoS;
use rustls::ClientConnection;
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Largest inbound packet accepted by default
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CONNACK_TIMEOUT: Duration = Duration::from_secs(30);
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
struct Target {
    host: String,
    port: u16,
    keepalive: Duration,
}

/// Outcome of draining the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Filled {
    bytes: usize,
    closed: bool,
}

/// Connected socket, with the TLS session layered on top when enabled
#[derive(Debug)]
struct Link {
    tcp: TcpStream,
    tls: Option<ClientConnection>,
}

impl Link {
    fn wants_write(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| tls.wants_write())
    }

    /// Append everything readable to `buf`, noting whether the peer closed
    fn fill(&mut self, buf: &mut BytesMut) -> Result<Filled, EngineError> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut filled = Filled {
            bytes: 0,
            closed: false,
        };

        let Some(tls) = self.tls.as_mut() else {
            loop {
                match self.tcp.read(&mut chunk) {
                    Ok(0) => {
                        filled.closed = true;
                        return Ok(filled);
                    }
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        filled.bytes += n;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(filled),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        loop {
            match tls.read_tls(&mut self.tcp) {
                Ok(0) => filled.closed = true,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(filled),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            tls.process_new_packets().map_err(tls_error)?;

            loop {
                match tls.reader().read(&mut chunk) {
                    Ok(0) => {
                        filled.closed = true;
                        break;
                    }
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        filled.bytes += n;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        filled.closed = true;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if filled.closed {
                return Ok(filled);
            }
        }
    }

    /// Move `buf` onto the wire, through the TLS session when there is one
    fn flush(&mut self, buf: &mut BytesMut) -> Result<usize, EngineError> {
        let mut written = 0;

        let Some(tls) = self.tls.as_mut() else {
            while !buf.is_empty() {
                match self.tcp.write(&buf[..]) {
                    Ok(0) => return Err(closed_while_writing()),
                    Ok(n) => {
                        buf.advance(n);
                        written += n;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            return Ok(written);
        };

        while !buf.is_empty() {
            let accepted = tls.writer().write(&buf[..])?;
            if accepted == 0 {
                break;
            }
            buf.advance(accepted);
        }
        while tls.wants_write() {
            match tls.write_tls(&mut self.tcp) {
                Ok(0) => return Err(closed_while_writing()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(written)
    }

    fn close_notify(&mut self) {
        if let Some(tls) = self.tls.as_mut() {
            tls.send_close_notify();
        }
    }
}

fn closed_while_writing() -> EngineError {
    EngineError::ConnectionLost("socket closed while writing".to_string())
}

/// Poll-driven MQTT engine on a `TcpStream`, optionally wrapped in TLS
#[derive(Debug)]
pub struct TcpEngine {
    client_id: String,
    clean_session: bool,
    login: Option<(String, String)>,
    will: Option<Will>,
    tls: TlsSettings,
    max_packet_size: usize,
    target: Option<Target>,
    stream: Option<Link>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    next_pkid: u16,
    incoming_qos2: HashSet<u16>,
    connack_received: bool,
    connect_started: Instant,
    last_outbound: Instant,
    ping_sent: Option<Instant>,
}

impl Default for TcpEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpEngine {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            client_id: String::new(),
            clean_session: true,
            login: None,
            will: None,
            tls: TlsSettings::default(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            target: None,
            stream: None,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
            next_pkid: 0,
            incoming_qos2: HashSet::new(),
            connack_received: false,
            connect_started: now,
            last_outbound: now,
            ping_sent: None,
        }
    }

    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    /// Whether the broker has accepted the current connection
    pub fn is_session_open(&self) -> bool {
        self.stream.is_some() && self.connack_received
    }

    fn open(&mut self) -> Result<(), EngineError> {
        self.close();
        let target = self.target.clone().ok_or(EngineError::NoConnection)?;

        let session = if self.tls.enabled {
            Some(tls::client_connection(&self.tls, &target.host)?)
        } else {
            None
        };

        let tcp = dial(&target.host, target.port)?;
        tcp.set_nonblocking(true)?;
        tcp.set_nodelay(true)?;
        debug!(
            host = %target.host,
            port = target.port,
            fd = tcp.as_raw_fd(),
            tls = session.is_some(),
            "TCP connection established"
        );

        let mut connect = Connect::new(self.client_id.as_str());
        connect.keep_alive = target.keepalive.as_secs() as u16;
        connect.clean_session = self.clean_session;
        if let Some((username, password)) = &self.login {
            connect.set_login(username.as_str(), password.as_str());
        }
        connect.last_will = self.will.as_ref().map(|will| {
            LastWill::new(
                will.topic.as_str(),
                will.payload.to_vec(),
                will.qos,
                will.retain,
            )
        });
        connect
            .write(&mut self.write_buf)
            .map_err(codec_error)?;

        let now = Instant::now();
        self.stream = Some(Link { tcp, tls: session });
        self.connect_started = now;
        self.last_outbound = now;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(link) = self.stream.take() {
            if let Err(e) = link.tcp.shutdown(Shutdown::Both) {
                trace!("Socket shutdown failed: {}", e);
            }
        }
        self.read_buf.clear();
        self.write_buf.clear();
        self.incoming_qos2.clear();
        self.connack_received = false;
        self.ping_sent = None;
    }

    fn ensure_stream(&self) -> Result<(), EngineError> {
        match self.stream {
            Some(_) => Ok(()),
            None => Err(EngineError::NoConnection),
        }
    }

    fn next_pkid(&mut self) -> u16 {
        self.next_pkid = self.next_pkid.wrapping_add(1);
        if self.next_pkid == 0 {
            self.next_pkid = 1;
        }
        self.next_pkid
    }

    /// Write as much buffered output as the socket accepts
    fn flush(&mut self) -> Result<usize, EngineError> {
        let link = self.stream.as_mut().ok_or(EngineError::NoConnection)?;
        let written = link.flush(&mut self.write_buf)?;
        if written > 0 {
            self.last_outbound = Instant::now();
        }
        Ok(written)
    }

    /// Decode every complete packet, then report a broker-side close
    fn read_packets(&mut self, callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError> {
        let link = self.stream.as_mut().ok_or(EngineError::NoConnection)?;
        let filled = link.fill(&mut self.read_buf)?;
        trace!(bytes = filled.bytes, closed = filled.closed, "Read from socket");

        while self.stream.is_some() {
            match read_packet(&mut self.read_buf, self.max_packet_size) {
                Ok(packet) => self.handle_packet(packet, callbacks)?,
                Err(CodecError::InsufficientBytes(_)) => break,
                Err(e) => return Err(codec_error(e)),
            }
        }

        if filled.closed && self.stream.is_some() {
            return Err(EngineError::ConnectionLost(
                "connection closed by broker".to_string(),
            ));
        }
        Ok(())
    }

    fn handle_packet(
        &mut self,
        packet: Packet,
        callbacks: &mut dyn EngineCallbacks,
    ) -> Result<(), EngineError> {
        match packet {
            Packet::ConnAck(ack) => {
                if self.connack_received {
                    return Err(EngineError::Protocol("duplicate CONNACK".to_string()));
                }
                let code = ack.code as u8;
                callbacks.on_log(
                    LogLevel::Debug,
                    &format!("received CONNACK (code {code}, session present {})", ack.session_present),
                );
                if code == 0 {
                    self.connack_received = true;
                    callbacks.on_connect(0);
                } else {
                    self.close();
                    callbacks.on_connect(code);
                }
            }
            Packet::Publish(publish) => self.handle_publish(publish, callbacks)?,
            Packet::PubAck(ack) => callbacks.on_publish(ack.pkid),
            Packet::PubRec(rec) => {
                PubRel::new(rec.pkid)
                    .write(&mut self.write_buf)
                    .map_err(codec_error)?;
            }
            Packet::PubRel(rel) => {
                self.incoming_qos2.remove(&rel.pkid);
                PubComp::new(rel.pkid)
                    .write(&mut self.write_buf)
                    .map_err(codec_error)?;
            }
            Packet::PubComp(comp) => callbacks.on_publish(comp.pkid),
            Packet::SubAck(ack) => {
                let granted: Vec<u8> = ack
                    .return_codes
                    .iter()
                    .map(|code| match code {
                        SubscribeReasonCode::Success(qos) => qos_to_u8(*qos),
                        SubscribeReasonCode::Failure => 0x80,
                    })
                    .collect();
                callbacks.on_subscribe(ack.pkid, &granted);
            }
            Packet::UnsubAck(ack) => callbacks.on_unsubscribe(ack.pkid),
            Packet::PingResp => {
                trace!("Received PINGRESP");
                self.ping_sent = None;
            }
            other => {
                return Err(EngineError::Protocol(format!(
                    "unexpected packet from broker: {other:?}"
                )));
            }
        }
        Ok(())
    }

    fn handle_publish(
        &mut self,
        publish: Publish,
        callbacks: &mut dyn EngineCallbacks,
    ) -> Result<(), EngineError> {
        let duplicate = match publish.qos {
            QoS::AtMostOnce => false,
            QoS::AtLeastOnce => {
                PubAck::new(publish.pkid)
                    .write(&mut self.write_buf)
                    .map_err(codec_error)?;
                false
            }
            QoS::ExactlyOnce => {
                PubRec::new(publish.pkid)
                    .write(&mut self.write_buf)
                    .map_err(codec_error)?;
                !self.incoming_qos2.insert(publish.pkid)
            }
        };

        if duplicate {
            debug!(pkid = publish.pkid, "Skipping redelivered QoS 2 message");
            return Ok(());
        }

        let message = Message {
            mid: publish.pkid,
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        };
        callbacks.on_message(&message);
        Ok(())
    }

    fn housekeeping(&mut self) -> Result<(), EngineError> {
        let Some(target) = &self.target else {
            return Ok(());
        };
        let keepalive = target.keepalive;

        if !self.connack_received {
            if self.connect_started.elapsed() >= CONNACK_TIMEOUT {
                return Err(EngineError::ConnectionLost(
                    "no CONNACK from broker".to_string(),
                ));
            }
            return Ok(());
        }
        if keepalive.is_zero() {
            return Ok(());
        }

        match self.ping_sent {
            Some(sent) if sent.elapsed() >= keepalive => Err(EngineError::ConnectionLost(
                "no PINGRESP within keepalive interval".to_string(),
            )),
            Some(_) => Ok(()),
            None if self.last_outbound.elapsed() >= keepalive => {
                trace!("Sending PINGREQ");
                PingReq.write(&mut self.write_buf).map_err(codec_error)?;
                self.ping_sent = Some(Instant::now());
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Run a loop step, closing the socket if it fails
    fn guarded<T>(
        &mut self,
        step: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let result = step(self);
        if result.is_err() {
            self.close();
        }
        result
    }
}

impl ProtocolEngine for TcpEngine {
    fn reinitialise(&mut self, client_id: &str, clean_session: bool) -> Result<(), EngineError> {
        self.close();
        self.client_id = client_id.to_string();
        self.clean_session = clean_session;
        self.login = None;
        self.will = None;
        self.tls = TlsSettings::default();
        self.target = None;
        self.next_pkid = 0;
        Ok(())
    }

    fn set_credentials(
        &mut self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), EngineError> {
        self.login = match (username, password) {
            (None, None) => None,
            (Some(username), password) => {
                Some((username.to_string(), password.unwrap_or_default().to_string()))
            }
            (None, Some(_)) => {
                return Err(EngineError::InvalidArgument(
                    "password requires a username".to_string(),
                ))
            }
        };
        Ok(())
    }

    fn set_tls(&mut self, tls: &TlsSettings) -> Result<(), EngineError> {
        if tls.enabled {
            tls::build_client_config(tls)?;
        }
        self.tls = tls.clone();
        Ok(())
    }

    fn set_will(&mut self, will: Option<&Will>) -> Result<(), EngineError> {
        self.will = will.cloned();
        Ok(())
    }

    fn connect(&mut self, host: &str, port: u16, keepalive_secs: u16) -> Result<(), EngineError> {
        self.target = Some(Target {
            host: host.to_string(),
            port,
            keepalive: Duration::from_secs(u64::from(keepalive_secs)),
        });
        self.open()
    }

    fn reconnect(&mut self) -> Result<(), EngineError> {
        self.open()
    }

    fn disconnect(&mut self, callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError> {
        if self.stream.is_none() {
            return Err(EngineError::NoConnection);
        }

        Disconnect.write(&mut self.write_buf).map_err(codec_error)?;
        if let Some(link) = self.stream.as_mut() {
            link.close_notify();
        }
        if let Err(e) = self.flush() {
            warn!("Could not flush DISCONNECT: {}", e);
        }
        self.close();
        callbacks.on_disconnect(0);
        Ok(())
    }

    fn socket(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|link| link.tcp.as_raw_fd())
    }

    fn want_write(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|link| !self.write_buf.is_empty() || link.wants_write())
    }

    fn loop_read(&mut self, callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError> {
        self.guarded(|engine| engine.read_packets(callbacks))
    }

    fn loop_write(&mut self, _callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError> {
        self.guarded(|engine| {
            let written = engine.flush()?;
            trace!(bytes = written, "Flushed to socket");
            Ok(())
        })
    }

    fn loop_misc(&mut self, _callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError> {
        if self.stream.is_none() {
            return Ok(());
        }
        self.guarded(Self::housekeeping)
    }

    fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<u16, EngineError> {
        self.ensure_stream()?;
        let pkid = self.next_pkid();
        let mut subscribe = Subscribe::new(filter, qos);
        subscribe.pkid = pkid;
        subscribe.write(&mut self.write_buf).map_err(codec_error)?;
        Ok(pkid)
    }

    fn unsubscribe(&mut self, filter: &str) -> Result<u16, EngineError> {
        self.ensure_stream()?;
        let pkid = self.next_pkid();
        let mut unsubscribe = Unsubscribe::new(filter);
        unsubscribe.pkid = pkid;
        unsubscribe
            .write(&mut self.write_buf)
            .map_err(codec_error)?;
        Ok(pkid)
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<u16, EngineError> {
        self.ensure_stream()?;
        let pkid = match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce | QoS::ExactlyOnce => self.next_pkid(),
        };
        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: topic.to_string(),
            pkid,
            payload,
        };
        publish.write(&mut self.write_buf).map_err(codec_error)?;
        Ok(pkid)
    }
}

impl Drop for TcpEngine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Blocking TCP connect trying every resolved address in turn
fn dial(host: &str, port: u16) -> Result<TcpStream, EngineError> {
    let mut last_error = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, "TCP connect failed: {}", e);
                last_error = Some(e);
            }
        }
    }
    Err(match last_error {
        Some(e) => e.into(),
        None => EngineError::InvalidArgument(format!("{host} did not resolve to any address")),
    })
}

fn codec_error(error: CodecError) -> EngineError {
    EngineError::Protocol(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::BufReader;
    use std::net::TcpListener;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread;

    #[derive(Default)]
    struct Recorded {
        connects: Vec<u8>,
        disconnects: Vec<i32>,
        messages: Vec<Message>,
        published: Vec<u16>,
        subscribed: Vec<(u16, Vec<u8>)>,
        unsubscribed: Vec<u16>,
    }

    impl EngineCallbacks for Recorded {
        fn on_connect(&mut self, code: u8) {
            self.connects.push(code);
        }
        fn on_disconnect(&mut self, code: i32) {
            self.disconnects.push(code);
        }
        fn on_message(&mut self, message: &Message) {
            self.messages.push(message.clone());
        }
        fn on_log(&mut self, _level: LogLevel, _text: &str) {}
        fn on_error(&mut self, _reason: &str) {}
        fn on_publish(&mut self, mid: u16) {
            self.published.push(mid);
        }
        fn on_subscribe(&mut self, mid: u16, granted: &[u8]) {
            self.subscribed.push((mid, granted.to_vec()));
        }
        fn on_unsubscribe(&mut self, mid: u16) {
            self.unsubscribed.push(mid);
        }
    }

    struct Broker {
        stream: TcpStream,
        buf: BytesMut,
    }

    impl Broker {
        fn next_packet(&mut self) -> Packet {
            loop {
                match read_packet(&mut self.buf, DEFAULT_MAX_PACKET_SIZE) {
                    Ok(packet) => return packet,
                    Err(CodecError::InsufficientBytes(_)) => {
                        let mut chunk = [0u8; 1024];
                        let n = self.stream.read(&mut chunk).unwrap();
                        assert!(n > 0, "client closed the connection");
                        self.buf.extend_from_slice(&chunk[..n]);
                    }
                    Err(e) => panic!("broker failed to decode packet: {e}"),
                }
            }
        }

        fn send(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).unwrap();
        }
    }

    fn connected_pair() -> (TcpEngine, Broker) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut engine = TcpEngine::new();
        engine.reinitialise("test-client", true).unwrap();
        engine.connect("127.0.0.1", port, 30).unwrap();

        let (stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let broker = Broker {
            stream,
            buf: BytesMut::new(),
        };
        (engine, broker)
    }

    fn pump_until(
        engine: &mut TcpEngine,
        recorded: &mut Recorded,
        done: impl Fn(&Recorded) -> bool,
    ) {
        for _ in 0..100 {
            engine.loop_read(recorded).unwrap();
            if done(recorded) {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("engine did not observe the expected packets");
    }

    fn handshake(engine: &mut TcpEngine, broker: &mut Broker, recorded: &mut Recorded) {
        assert!(engine.want_write());
        engine.loop_write(recorded).unwrap();
        assert!(!engine.want_write());

        match broker.next_packet() {
            Packet::Connect(connect) => {
                assert_eq!(connect.client_id, "test-client");
                assert_eq!(connect.keep_alive, 30);
                assert!(connect.clean_session);
            }
            other => panic!("expected CONNECT, got {other:?}"),
        }
        broker.send(&[0x20, 0x02, 0x00, 0x00]);
        pump_until(engine, recorded, |r| !r.connects.is_empty());
    }

    #[test]
    fn test_connect_handshake() {
        let (mut engine, mut broker) = connected_pair();
        let mut recorded = Recorded::default();

        assert!(engine.socket().is_some());
        handshake(&mut engine, &mut broker, &mut recorded);
        assert_eq!(recorded.connects, vec![0]);
        assert!(engine.is_session_open());
    }

    #[test]
    fn test_refused_connack_closes_socket() {
        let (mut engine, mut broker) = connected_pair();
        let mut recorded = Recorded::default();
        engine.loop_write(&mut recorded).unwrap();
        broker.next_packet();

        broker.send(&[0x20, 0x02, 0x00, 0x05]);
        pump_until(&mut engine, &mut recorded, |r| !r.connects.is_empty());

        assert_eq!(recorded.connects, vec![5]);
        assert_eq!(engine.socket(), None);
    }

    #[test]
    fn test_inbound_qos1_message_is_acknowledged() {
        let (mut engine, mut broker) = connected_pair();
        let mut recorded = Recorded::default();
        handshake(&mut engine, &mut broker, &mut recorded);

        let mut buf = BytesMut::new();
        Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "sensors/temp".to_string(),
            pkid: 9,
            payload: Bytes::from_static(b"21.5"),
        }
        .write(&mut buf)
        .unwrap();
        broker.send(&buf);
        pump_until(&mut engine, &mut recorded, |r| !r.messages.is_empty());

        let message = &recorded.messages[0];
        assert_eq!(message.topic, "sensors/temp");
        assert_eq!(message.text(), "21.5");
        assert_eq!(message.mid, 9);

        assert!(engine.want_write());
        engine.loop_write(&mut recorded).unwrap();
        match broker.next_packet() {
            Packet::PubAck(ack) => assert_eq!(ack.pkid, 9),
            other => panic!("expected PUBACK, got {other:?}"),
        }
    }

    #[test]
    fn test_subscribe_and_suback() {
        let (mut engine, mut broker) = connected_pair();
        let mut recorded = Recorded::default();
        handshake(&mut engine, &mut broker, &mut recorded);

        let pkid = engine.subscribe("sensors/#", QoS::AtLeastOnce).unwrap();
        engine.loop_write(&mut recorded).unwrap();
        match broker.next_packet() {
            Packet::Subscribe(subscribe) => {
                assert_eq!(subscribe.pkid, pkid);
                assert_eq!(subscribe.filters[0].path, "sensors/#");
            }
            other => panic!("expected SUBSCRIBE, got {other:?}"),
        }

        let [hi, lo] = pkid.to_be_bytes();
        broker.send(&[0x90, 0x03, hi, lo, 0x01]);
        pump_until(&mut engine, &mut recorded, |r| !r.subscribed.is_empty());
        assert_eq!(recorded.subscribed, vec![(pkid, vec![1])]);
    }

    #[test]
    fn test_qos1_publish_completes_on_puback() {
        let (mut engine, mut broker) = connected_pair();
        let mut recorded = Recorded::default();
        handshake(&mut engine, &mut broker, &mut recorded);

        assert_eq!(
            engine
                .publish("a/b", Bytes::from_static(b"x"), QoS::AtMostOnce, false)
                .unwrap(),
            0
        );
        let pkid = engine
            .publish("a/b", Bytes::from_static(b"y"), QoS::AtLeastOnce, false)
            .unwrap();
        assert_ne!(pkid, 0);
        engine.loop_write(&mut recorded).unwrap();
        assert!(matches!(broker.next_packet(), Packet::Publish(p) if p.qos == QoS::AtMostOnce));
        assert!(matches!(broker.next_packet(), Packet::Publish(p) if p.pkid == pkid));

        let [hi, lo] = pkid.to_be_bytes();
        broker.send(&[0x40, 0x02, hi, lo]);
        pump_until(&mut engine, &mut recorded, |r| !r.published.is_empty());
        assert_eq!(recorded.published, vec![pkid]);
    }

    #[test]
    fn test_disconnect_sends_packet_and_confirms() {
        let (mut engine, mut broker) = connected_pair();
        let mut recorded = Recorded::default();
        handshake(&mut engine, &mut broker, &mut recorded);

        engine.disconnect(&mut recorded).unwrap();
        assert_eq!(recorded.disconnects, vec![0]);
        assert_eq!(engine.socket(), None);
        assert!(matches!(broker.next_packet(), Packet::Disconnect));

        assert!(matches!(
            engine.disconnect(&mut recorded),
            Err(EngineError::NoConnection)
        ));
    }

    #[test]
    fn test_peer_close_is_fatal() {
        let (mut engine, broker) = connected_pair();
        let mut recorded = Recorded::default();
        drop(broker);

        let mut result = Ok(());
        for _ in 0..100 {
            result = engine.loop_read(&mut recorded);
            if result.is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(result, Err(EngineError::ConnectionLost(_))));
        assert_eq!(engine.socket(), None);
    }

    #[test]
    fn test_refused_connack_before_broker_close() {
        let (mut engine, mut broker) = connected_pair();
        let mut recorded = Recorded::default();
        engine.loop_write(&mut recorded).unwrap();
        broker.next_packet();

        broker.send(&[0x20, 0x02, 0x00, 0x05]);
        drop(broker);
        pump_until(&mut engine, &mut recorded, |r| !r.connects.is_empty());

        assert_eq!(recorded.connects, vec![5]);
        assert_eq!(engine.socket(), None);
    }

    #[test]
    fn test_messages_before_broker_close_are_delivered() {
        let (mut engine, mut broker) = connected_pair();
        let mut recorded = Recorded::default();
        handshake(&mut engine, &mut broker, &mut recorded);

        let mut buf = BytesMut::new();
        for payload in [&b"last"[..], &b"words"[..]] {
            Publish::new("status/broker", QoS::AtMostOnce, payload.to_vec())
                .write(&mut buf)
                .unwrap();
        }
        broker.send(&buf);
        drop(broker);

        let mut result = Ok(());
        for _ in 0..100 {
            result = engine.loop_read(&mut recorded);
            if result.is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(result, Err(EngineError::ConnectionLost(_))));
        let payloads: Vec<_> = recorded.messages.iter().map(|m| m.text().into_owned()).collect();
        assert_eq!(payloads, vec!["last", "words"]);
        assert_eq!(engine.socket(), None);
    }

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures/tls")
            .join(name)
    }

    fn tls_settings(insecure: bool) -> TlsSettings {
        TlsSettings {
            enabled: true,
            insecure,
            ca_file: Some(fixture("ca.pem")),
            ..TlsSettings::default()
        }
    }

    /// Accept one TLS client, answer its CONNECT and hold the socket until
    /// the client goes away
    fn spawn_tls_broker(listener: TcpListener) -> BrokerHandle {
        thread::spawn(move || {
            let certs = rustls_pemfile::certs(&mut BufReader::new(
                File::open(fixture("server.pem")).unwrap(),
            ))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
            let key = rustls_pemfile::private_key(&mut BufReader::new(
                File::open(fixture("server.key")).unwrap(),
            ))
            .unwrap()
            .unwrap();
            let config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .unwrap();

            let (tcp, _) = listener.accept().unwrap();
            tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let session = rustls::ServerConnection::new(Arc::new(config)).unwrap();
            let mut stream = rustls::StreamOwned::new(session, tcp);

            let mut buf = BytesMut::new();
            let mut chunk = [0u8; 1024];
            let packet = loop {
                match read_packet(&mut buf, DEFAULT_MAX_PACKET_SIZE) {
                    Ok(packet) => break packet,
                    Err(CodecError::InsufficientBytes(_)) => {
                        let n = stream.read(&mut chunk).map_err(|e| e.to_string())?;
                        if n == 0 {
                            return Err("client closed the connection".to_string());
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }
                    Err(e) => return Err(e.to_string()),
                }
            };

            stream
                .write_all(&[0x20, 0x02, 0x00, 0x00])
                .and_then(|_| stream.flush())
                .map_err(|e| e.to_string())?;
            while matches!(stream.read(&mut chunk), Ok(n) if n > 0) {}
            Ok(packet)
        })
    }

    fn pump_tls(engine: &mut TcpEngine, recorded: &mut Recorded) -> Result<(), EngineError> {
        for _ in 0..300 {
            if engine.want_write() {
                engine.loop_write(recorded)?;
            }
            engine.loop_read(recorded)?;
            if !recorded.connects.is_empty() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("TLS session did not complete");
    }

    type BrokerHandle = thread::JoinHandle<Result<Packet, String>>;

    fn tls_engine(host: &str, insecure: bool) -> (TcpEngine, BrokerHandle) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = spawn_tls_broker(listener);

        let mut engine = TcpEngine::new();
        engine.reinitialise("tls-client", true).unwrap();
        engine.set_tls(&tls_settings(insecure)).unwrap();
        engine.connect(host, port, 30).unwrap();
        (engine, broker)
    }

    #[test]
    fn test_tls_session_carries_mqtt() {
        let (mut engine, broker) = tls_engine("localhost", false);
        let mut recorded = Recorded::default();

        assert!(engine.want_write());
        pump_tls(&mut engine, &mut recorded).unwrap();
        assert_eq!(recorded.connects, vec![0]);
        assert!(engine.is_session_open());

        drop(engine);
        match broker.join().unwrap() {
            Ok(Packet::Connect(connect)) => assert_eq!(connect.client_id, "tls-client"),
            other => panic!("expected CONNECT over TLS, got {other:?}"),
        }
    }

    #[test]
    fn test_tls_rejects_certificate_for_another_host() {
        let (mut engine, broker) = tls_engine("127.0.0.1", false);
        let mut recorded = Recorded::default();

        let result = pump_tls(&mut engine, &mut recorded);
        assert!(matches!(result, Err(EngineError::Tls(_))), "{result:?}");
        assert!(recorded.connects.is_empty());
        assert_eq!(engine.socket(), None);
        assert!(broker.join().unwrap().is_err());
    }

    #[test]
    fn test_tls_insecure_accepts_host_mismatch() {
        let (mut engine, broker) = tls_engine("127.0.0.1", true);
        let mut recorded = Recorded::default();

        pump_tls(&mut engine, &mut recorded).unwrap();
        assert_eq!(recorded.connects, vec![0]);

        drop(engine);
        assert!(matches!(broker.join().unwrap(), Ok(Packet::Connect(_))));
    }

    #[test]
    fn test_requests_need_a_socket() {
        let mut engine = TcpEngine::new();
        assert!(matches!(
            engine.subscribe("a", QoS::AtMostOnce),
            Err(EngineError::NoConnection)
        ));
        assert!(matches!(engine.reconnect(), Err(EngineError::NoConnection)));
        assert!(!engine.want_write());
        let mut recorded = Recorded::default();
        assert!(engine.loop_misc(&mut recorded).is_ok());
    }

    #[test]
    fn test_option_validation() {
        let mut engine = TcpEngine::new();
        let tls = TlsSettings {
            enabled: true,
            ca_file: Some("/nonexistent/ca.pem".into()),
            ..TlsSettings::default()
        };
        assert!(matches!(engine.set_tls(&tls), Err(EngineError::Tls(_))));
        assert!(engine.set_tls(&tls_settings(false)).is_ok());
        assert!(engine.set_tls(&TlsSettings::default()).is_ok());
        assert!(matches!(
            engine.set_credentials(None, Some("pw")),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(engine.set_credentials(Some("user"), None).is_ok());
    }

    #[test]
    fn test_packet_ids_skip_zero() {
        let mut engine = TcpEngine::new();
        engine.next_pkid = u16::MAX - 1;
        assert_eq!(engine.next_pkid(), u16::MAX);
        assert_eq!(engine.next_pkid(), 1);
    }
}
