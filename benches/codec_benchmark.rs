use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

use pairlink::transport::{IceCandidate, SdpType, SessionDescription};
use pairlink::{HandshakePayload, Message, RoomId};

/// offer with a few host candidates, roughly the size of a real one
fn create_offer() -> HandshakePayload {
    let sdp = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
               a=group:BUNDLE 0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
               c=IN IP4 0.0.0.0\r\na=ice-ufrag:bench\r\na=ice-pwd:benchmarkbenchmarkbench\r\n\
               a=setup:actpass\r\na=mid:0\r\na=sctp-port:5000\r\n"
        .repeat(4);

    let candidates = (0..4)
        .map(|i| IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 192.168.1.{} {} typ host",
                i,
                100 + i,
                50000 + i
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        })
        .collect();

    HandshakePayload::new(
        SessionDescription {
            sdp_type: SdpType::Offer,
            sdp,
        },
        RoomId::from("BENCH1"),
        candidates,
    )
}

/// handshake payload encoding benchmark
fn bench_encode(c: &mut Criterion) {
    let payload = create_offer();

    let mut group = c.benchmark_group("Encode");
    group.throughput(Throughput::Elements(1));

    group.bench_function("HandshakePayload", |b| {
        b.iter(|| black_box(black_box(&payload).encode()))
    });

    group.finish();
}

/// handshake payload decoding benchmark
fn bench_decode(c: &mut Criterion) {
    let encoded = create_offer().encode();

    let mut group = c.benchmark_group("Decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("HandshakePayload", |b| {
        b.iter(|| {
            let payload = HandshakePayload::decode(black_box(&encoded)).unwrap();
            black_box(payload)
        })
    });

    group.finish();
}

/// channel message envelope benchmark
fn bench_message(c: &mut Criterion) {
    let message = Message::new("chat", serde_json::json!({"text": "hello", "seq": 42}));
    let text = message.to_text().unwrap();

    let mut group = c.benchmark_group("Message");
    group.throughput(Throughput::Elements(1));

    group.bench_function("to_text", |b| {
        b.iter(|| black_box(black_box(&message).to_text().unwrap()))
    });

    group.bench_function("from_text", |b| {
        b.iter(|| black_box(Message::from_text(black_box(&text)).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_message);
criterion_main!(benches);
