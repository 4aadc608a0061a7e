use criterion::{black_box, criterion_group, criterion_main, Criterion};

use packet_transport::{
    BlockOpcode, CompletionDisposition, OperationKind, Packet, PacketStatus,
};

fn bench_allocate_release(c: &mut Criterion) {
    c.bench_function("payload_allocate_release", |b| {
        let mut packet = Packet::new();
        b.iter(|| {
            let handle = packet
                .payload_mut()
                .allocate(black_box(OperationKind::Block))
                .unwrap();
            packet.payload_mut().promote();
            packet.payload_mut().release(handle).unwrap();
        });
    });
}

fn bench_block_build(c: &mut Criterion) {
    c.bench_function("block_operation_build", |b| {
        let mut packet = Packet::new();
        let handle = packet
            .payload_mut()
            .allocate(OperationKind::Block)
            .unwrap();
        packet.payload_mut().promote();
        b.iter(|| {
            let op = packet.payload_mut().get_mut(handle).unwrap();
            op.as_block_mut().unwrap().build(
                black_box(BlockOpcode::Read),
                black_box(0x10000),
                black_box(0x800),
                520,
                64,
                None,
            );
        });
    });
}

fn bench_completion_unwind(c: &mut Criterion) {
    c.bench_function("completion_unwind_depth_8", |b| {
        b.iter(|| {
            let mut packet = Packet::new();
            packet.start().unwrap();
            for _ in 0..8 {
                packet
                    .set_completion(Box::new(|_p| {
                        CompletionDisposition::Continue
                    }))
                    .unwrap();
            }
            packet.complete_with(PacketStatus::ok()).unwrap();
            black_box(packet);
        });
    });
}

criterion_group!(
    benches,
    bench_allocate_release,
    bench_block_build,
    bench_completion_unwind
);
criterion_main!(benches);
