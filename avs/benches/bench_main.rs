use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::Rng;

use avs::container::Worker;
use avs::object::Object;

fn mock_objects(num: usize) -> Vec<Object> {
    let mut rng = rand::thread_rng();
    let mut list = Vec::with_capacity(num);
    for i in 0..num {
        let mut body = vec![0u8; rng.gen_range(64..1024)];
        rng.fill(&mut body[..]);
        list.push(Object::new(42, format!("bench/{}", i).into_bytes(), body));
    }
    list
}

fn put_get_cycle(worker: &mut Worker, objects: &[Object]) -> u64 {
    let mut read = 0u64;
    for obj in objects {
        worker.put(obj.clone()).unwrap();
    }
    for obj in objects {
        let (_, body) = worker.get(obj.addr_id, &obj.key, 0, -1).unwrap();
        read += body.len() as u64;
    }
    read
}

fn criterion_benchmark(c: &mut Criterion) {
    let dir = tempdir::TempDir::new("avs-bench").unwrap();
    let mut worker = Worker::init("bench", 1, "m-bench", dir.path()).unwrap();
    let objects = mock_objects(100);

    c.bench_function("put+get 100 objects", |b| {
        b.iter(|| put_get_cycle(&mut worker, black_box(&objects)))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
