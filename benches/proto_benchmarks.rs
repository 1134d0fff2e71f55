/// Frame encode/decode cost of the raw protocol, plus a full loopback Call.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};

use wirecall::message::Body;
use wirecall::proto::{ProtoContext, RawProto};
use wirecall::{CallCtx, Endpoint, EndpointConfig, Message, MessageType, Status};

fn sample_message(items: usize) -> Message {
    let mut msg = Message::new(MessageType::Call, "/bench/echo?x=1", 42);
    msg.meta.set("trace-id", "abc123");
    msg.body_codec = wirecall::codec::JSON_CODEC_ID;
    msg.body = Body::Value(json!({ "items": (0..items).collect::<Vec<_>>() }));
    msg
}

fn bench_raw_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("RawProto");
    let proto = RawProto::new(ProtoContext::default());

    for items in [0usize, 16, 1024] {
        group.bench_with_input(BenchmarkId::new("encode", items), &items, |b, &items| {
            let msg = sample_message(items);
            b.iter(|| {
                let mut msg = msg.clone();
                black_box(proto.encode(&mut msg).unwrap())
            });
        });

        let frame = proto.encode(&mut sample_message(items)).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", items), &frame, |b, frame| {
            b.iter(|| {
                let mut msg = Message::default();
                proto.decode(black_box(frame), &mut msg).unwrap();
                black_box(msg)
            });
        });
    }

    group.bench_function("encode_with_checksum", |b| {
        let mut msg = sample_message(16);
        msg.xfer_pipe.push(wirecall::filter::SHA256_FILTER_ID);
        b.iter(|| {
            let mut msg = msg.clone();
            black_box(proto.encode(&mut msg).unwrap())
        });
    });

    group.finish();
}

fn bench_loopback_call(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (server, session) = rt.block_on(async {
        let server = Endpoint::new(EndpointConfig {
            listen_address: "127.0.0.1:0".to_string(),
            ..Default::default()
        })
        .unwrap();
        server
            .router()
            .route_call("/bench/echo", |_ctx: CallCtx, v: Value| async move {
                Ok::<_, Status>(v)
            })
            .unwrap();
        let addr = server.listen().await.unwrap();
        let client = Endpoint::new(EndpointConfig::default()).unwrap();
        let session = client.dial(&addr).await.unwrap();
        (server, session)
    });

    c.bench_function("loopback_call", |b| {
        b.to_async(&rt).iter(|| async {
            let reply: Value = session.call("/bench/echo", &json!([1, 2, 3]), &[]).await.unwrap();
            black_box(reply)
        });
    });

    rt.block_on(server.close());
}

criterion_group!(benches, bench_raw_codec, bench_loopback_call);
criterion_main!(benches);
