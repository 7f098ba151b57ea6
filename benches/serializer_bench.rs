use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use ringmaster_protocol::protocol::request::{Request, RequestCall};
use ringmaster_protocol::protocol::response::{Content, OpResult, RequestResponse};
use ringmaster_protocol::protocol::types::{CreateMode, Stat};
use ringmaster_protocol::protocol::RingMasterCommunicationProtocol;

fn multi_call(ops: usize) -> RequestCall {
    let requests = (0..ops)
        .map(|i| Request::create(format!("/bench/node-{i}"), Some(vec![0xAB; 128]), None, CreateMode::PERSISTENT))
        .collect();
    RequestCall::new(1, Request::multi(requests, true))
}

fn op_results(ops: usize) -> Vec<OpResult> {
    (0..ops)
        .map(|i| OpResult::Create {
            stat: Some(Stat::default()),
            path: Some(format!("/bench/node-{i}")),
        })
        .collect()
}

#[allow(clippy::unwrap_used)]
fn bench_requests(c: &mut Criterion) {
    let protocol = RingMasterCommunicationProtocol::new();
    let mut group = c.benchmark_group("request");

    for &ops in &[1usize, 16, 256] {
        let call = multi_call(ops);
        let bytes = protocol.serialize_request(&call, 25).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("serialize_multi", ops), &call, |b, call| {
            b.iter(|| protocol.serialize_request(call, 25).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("deserialize_multi", ops), &bytes, |b, bytes| {
            b.iter(|| protocol.deserialize_request(bytes, 25).unwrap())
        });
    }

    let small = RequestCall::new(9, Request::get_data("/bench/leaf", Default::default(), None));
    for version in [13u32, 19, 25] {
        group.bench_with_input(BenchmarkId::new("get_data_round_trip", version), &version, |b, &v| {
            b.iter(|| {
                let bytes = protocol.serialize_request(&small, v).unwrap();
                protocol.deserialize_request(&bytes, v).unwrap()
            })
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_responses(c: &mut Criterion) {
    let protocol = RingMasterCommunicationProtocol::new();
    let mut group = c.benchmark_group("response");

    for &ops in &[16usize, 256] {
        group.bench_function(BenchmarkId::new("serialize_op_results", ops), |b| {
            b.iter_batched(
                || RequestResponse::ok(1, Content::OpResultList(op_results(ops))),
                |response| protocol.serialize_response(response, 25).unwrap(),
                BatchSize::SmallInput,
            )
        });

        let bytes = protocol
            .serialize_response(RequestResponse::ok(1, Content::OpResultList(op_results(ops))), 25)
            .unwrap();
        group.bench_with_input(BenchmarkId::new("deserialize_op_results", ops), &bytes, |b, bytes| {
            b.iter(|| protocol.deserialize_response(bytes, 25).unwrap())
        });
    }

    for &size in &[64usize, 4096, 65536] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(BenchmarkId::new("byte_array", size), |b| {
            b.iter_batched(
                || RequestResponse::ok(1, Content::ByteArray(vec![0x5A; size])),
                |response| {
                    let bytes = protocol.serialize_response(response, 25).unwrap();
                    protocol.deserialize_response(&bytes, 25).unwrap()
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_requests, bench_responses);
criterion_main!(benches);
