use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use chrono::Utc;
use serde_json::Map;

use vitals_connector::submit::MqttConfig;
use vitals_connector::{IngestPayload, MqttPublisher, VitalKind, VitalSet, VitalsSink};

const PUBLISH: u8 = 0x30;
const CONNECT: u8 = 0x10;

fn payload(patient_id: u64) -> Result<IngestPayload> {
    let values = VitalSet::new()
        .with(VitalKind::HeartRate, 148.0)
        .with(VitalKind::Spo2, 96.0);
    IngestPayload::new(
        patient_id,
        "camera-009",
        &values,
        0.9,
        Duration::from_millis(80),
        Utc::now(),
        Map::new(),
    )
}

/// Read one MQTT control packet: first header byte and the variable part.
fn read_packet(stream: &mut TcpStream) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 1];
    stream.read_exact(&mut header)?;
    let mut length = 0usize;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte)?;
        length |= ((byte[0] & 0x7f) as usize) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body)?;
    Ok((header[0], body))
}

fn accept_within(listener: &TcpListener, timeout: Duration) -> Result<TcpStream> {
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(timeout))?;
                return Ok(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    bail!("no client connected within {:?}", timeout);
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Accept one MQTT v5 client, acknowledge its CONNECT and return the topic of
/// the first PUBLISH it sends.
fn broker_on(listener: TcpListener) -> JoinHandle<Result<String>> {
    std::thread::spawn(move || {
        let mut stream = accept_within(&listener, Duration::from_secs(15))?;
        let (kind, _) = read_packet(&mut stream)?;
        if kind != CONNECT {
            bail!("expected CONNECT, got packet type {:#04x}", kind);
        }
        // CONNACK: no session, success, no properties.
        stream.write_all(&[0x20, 0x03, 0x00, 0x00, 0x00])?;
        loop {
            let (kind, body) = read_packet(&mut stream)?;
            if kind & 0xf0 != PUBLISH {
                continue;
            }
            let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
            let topic = String::from_utf8_lossy(&body[2..2 + topic_len]).into_owned();
            if kind & 0x06 != 0 {
                let id = &body[2 + topic_len..4 + topic_len];
                stream.write_all(&[0x40, 0x02, id[0], id[1]])?;
            }
            return Ok(topic);
        }
    })
}

#[test]
fn publisher_recovers_once_broker_comes_up() -> Result<()> {
    let port = TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
    let publisher = MqttPublisher::connect(&MqttConfig {
        broker: format!("mqtt://127.0.0.1:{}", port),
        client_id: "vitals-connector-reconnect".to_string(),
        topic_prefix: "nicu/test".to_string(),
        ..MqttConfig::default()
    })?;
    let mut sink = publisher.submitter();

    sink.submit(&payload(4)?)?;
    // Let the first connection attempts fail against the closed port.
    std::thread::sleep(Duration::from_millis(500));

    let broker = broker_on(TcpListener::bind(("127.0.0.1", port))?);
    sink.submit(&payload(4)?)?;

    let topic = broker.join().expect("broker thread")?;
    assert_eq!(topic, "nicu/test/patient/4/vitals/camera");
    sink.submit(&payload(5)?)?;

    drop(sink);
    publisher.disconnect()?;
    Ok(())
}
