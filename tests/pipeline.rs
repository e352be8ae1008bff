//! End-to-end: text graph → kernels → schedule → host execution.

use std::sync::Arc;

use tessera::device::host::{self, HostOptions};
use tessera::device::DeviceRegistry;
use tessera::engine::{ProgramCache, Runner};
use tessera::ir::Op;
use tessera::schedule::BufferDesc;
use tessera::{
    create_schedule, kernelize_map, parse_graph, Config, Engine, EngineError, GraphFile, Kernelized,
    LowerError, Schedule,
};

struct Compiled {
    file: GraphFile,
    k: Kernelized,
    schedule: Schedule,
}

fn compile(source: &str, config: &Config) -> Compiled {
    let mut file = match parse_graph(source, "scenario.tg") {
        Ok(file) => file,
        Err(diags) => panic!("{:?}", diags.iter().map(|d| &d.message).collect::<Vec<_>>()),
    };
    let sink = file.sink();
    let k = kernelize_map(&mut file.graph, sink, &config.kernelize_options()).unwrap();
    let schedule = create_schedule(&file.graph, k.sink).unwrap();
    Compiled { file, k, schedule }
}

fn init(engine: &mut Engine, file: &GraphFile) {
    for i in &file.inits {
        let desc = BufferDesc::from_node(&file.graph, i.node).unwrap();
        engine.write(&desc, &i.fill.values(desc.size)).unwrap();
    }
}

/// Run everything and read back output `index`.
fn run(engine: &mut Engine, c: &mut Compiled, index: usize) -> Vec<f64> {
    init(engine, &c.file);
    let vals = c.schedule.var_vals.clone();
    engine
        .run_schedule(&c.file.graph, &mut c.schedule.items, &vals)
        .unwrap();
    let node = c.file.graph.src(c.k.sink)[index];
    let mut vals = c.file.var_vals.clone();
    vals.extend(c.schedule.var_vals.clone());
    engine.readback(&mut c.file.graph, node, &vals).unwrap()
}

fn init_desc(c: &Compiled, name: &str) -> BufferDesc {
    let node = c.file.inits.iter().find(|i| i.name == name).unwrap().node;
    BufferDesc::from_node(&c.file.graph, node).unwrap()
}

const SCENARIO_A: &str = "\
a = buffer HOST f32 16 arange
b = buffer HOST f32 16 fill 2
c = add a b
d = mul c b
r = reshape d [4, 4]
s = sum r [1]
out s
";

#[test]
fn test_elementwise_into_reduction_is_one_kernel() {
    let mut c = compile(SCENARIO_A, &Config::default());
    assert_eq!(c.schedule.len(), 1);

    let item = &c.schedule.items[0];
    assert_eq!(item.bufs.len(), 3);
    assert_eq!(item.bufs[0].size, 4);
    assert_eq!(item.bufs[1..], [init_desc(&c, "a"), init_desc(&c, "b")]);
    assert_eq!(item.name(&c.file.graph), "k_4_4");
    assert!(item.provenance().contains("sum@scenario.tg:6"), "{}", item.provenance());

    let mut engine = Engine::host();
    // (i + 2) * 2 summed over rows of four
    assert_eq!(run(&mut engine, &mut c, 0), vec![28.0, 60.0, 92.0, 124.0]);
    assert_eq!(engine.stats().kernel_count, 1);
}

const SCENARIO_B: &str = "\
a = buffer HOST f32 16 arange
b = buffer HOST f32 16 fill 1
c = add a b
e = exp2 c
n = neg c
m = mul e n
out m
";

#[test]
fn test_shared_intermediate_is_materialized_once() {
    let mut c = compile(SCENARIO_B, &Config::default());
    assert_eq!(c.schedule.len(), 2);
    let (first, second) = (&c.schedule.items[0], &c.schedule.items[1]);
    assert_eq!(first.bufs[1..], [init_desc(&c, "a"), init_desc(&c, "b")]);
    assert_eq!(second.bufs.len(), 2);
    assert_eq!(second.bufs[1], first.bufs[0]);

    let mut engine = Engine::host();
    let expected: Vec<f64> = (1..=16).map(|x| -(x as f64) * 2f64.powi(x)).collect();
    assert_eq!(run(&mut engine, &mut c, 0), expected);
    assert_eq!(engine.stats().kernel_count, 2);
}

#[test]
fn test_fanout_policy_is_configurable() {
    let config = Config::parse("[realize]\nfanout = 0\n").unwrap();
    let mut c = compile(SCENARIO_B, &config);
    assert_eq!(c.schedule.len(), 1);

    let mut engine = Engine::host();
    let expected: Vec<f64> = (1..=16).map(|x| -(x as f64) * 2f64.powi(x)).collect();
    assert_eq!(run(&mut engine, &mut c, 0), expected);
}

#[test]
fn test_contiguous_subrange_is_a_buffer_view() {
    let source = "\
a = buffer HOST f32 16 arange
w = shrink a [4:12]
c = contiguous w
out c
";
    let mut c = compile(source, &Config::default());
    assert!(c.schedule.is_empty());
    let out = c.file.graph.src(c.k.sink)[0];
    assert_eq!(c.file.graph.op(out), Op::BufferView);

    let mut engine = Engine::host();
    let values = run(&mut engine, &mut c, 0);
    assert_eq!(values, (4..12).map(|i| i as f64).collect::<Vec<_>>());
    // only the source buffer was ever allocated
    assert_eq!(engine.pool().len(), 1);
}

const SCENARIO_D: &str = "\
a = buffer HOST:0 f32 8 arange
x = mul a a
y = copy x HOST:1
z = add y y
out z
";

fn runners(engine: &Engine, c: &Compiled) -> Vec<&'static str> {
    c.schedule
        .items
        .iter()
        .map(|item| match engine.lower_schedule_item(&c.file.graph, item).unwrap().runner {
            Runner::Compiled(_) => "kernel",
            Runner::Transfer { .. } => "transfer",
            Runner::Copy { .. } => "copy",
        })
        .collect()
}

#[test]
fn test_cross_device_dependency_uses_a_transfer() {
    let mut c = compile(SCENARIO_D, &Config::default());
    let mut engine = Engine::host();
    assert_eq!(runners(&engine, &c), vec!["kernel", "transfer", "kernel"]);

    let copy = &c.schedule.items[1];
    assert_eq!(copy.bufs[0].device, "HOST:1");
    assert_eq!(copy.bufs[1].device, "HOST:0");

    let expected: Vec<f64> = (0..8).map(|i| 2.0 * (i * i) as f64).collect();
    assert_eq!(run(&mut engine, &mut c, 0), expected);
    assert_eq!(engine.stats().kernel_count, 3);
}

#[test]
fn test_cross_device_without_transfer_copies_through_the_host() {
    let mut c = compile(SCENARIO_D, &Config::default());
    let mut registry = DeviceRegistry::new();
    registry.register_family("HOST", host::family(HostOptions::without_transfer()));
    let mut engine = Engine::new(registry, Arc::new(ProgramCache::new()));
    assert_eq!(runners(&engine, &c), vec!["kernel", "copy", "kernel"]);

    let expected: Vec<f64> = (0..8).map(|i| 2.0 * (i * i) as f64).collect();
    assert_eq!(run(&mut engine, &mut c, 0), expected);
}

#[test]
fn test_symbolic_window() {
    let source = "\
n = var 1 8 3
a = buffer HOST f32 8 arange
w = shrink a [0:n]
e = neg w
out e
";
    let mut c = compile(source, &Config::default());
    assert_eq!(c.schedule.len(), 1);
    assert!(!c.schedule.items[0].fixedvars.is_empty());
    let mut engine = Engine::host();
    assert_eq!(run(&mut engine, &mut c, 0), vec![0.0, -1.0, -2.0]);
}

#[test]
fn test_cache_survives_sessions() {
    let cache = Arc::new(ProgramCache::new());
    for _ in 0..2 {
        let mut c = compile(SCENARIO_A, &Config::default());
        let mut engine = Engine::new(DeviceRegistry::with_host(), cache.clone());
        assert_eq!(run(&mut engine, &mut c, 0), vec![28.0, 60.0, 92.0, 124.0]);
    }
    let counters = cache.counters();
    assert_eq!(counters.misses, 1);
    assert_eq!(counters.hits, 1);
}

#[test]
fn test_unknown_device_reports_the_statement() {
    let source = "\
a = buffer GPU f32 4 arange
e = exp2 a
out e
";
    let mut c = compile(source, &Config::default());
    let mut engine = Engine::host();
    let vals = c.schedule.var_vals.clone();
    let err = engine
        .run_schedule(&c.file.graph, &mut c.schedule.items, &vals)
        .unwrap_err();
    match err {
        EngineError::Lower {
            kernel,
            provenance,
            source,
        } => {
            assert_eq!(kernel, "k_4");
            assert_eq!(provenance, "exp2@scenario.tg:2");
            assert_eq!(source, LowerError::UnknownDevice("GPU".to_string()));
        }
        other => panic!("unexpected {}", other),
    }
}
