use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use npcscript::game::pc::Character;
use npcscript::{ParseOptions, ScriptEngine};

const LOOP: &str = r#"{
    freeloop(1);
    for (.@i = 0; .@i < 1000; .@i++) {
        .@sum += .@i * 2 % 7;
        if (.@i % 100 == 0)
            setarray .@marks[.@i / 100], .@i;
    }
    $result = .@sum + getarraysize(.@marks);
    end;
}"#;

const STRINGS: &str = r#"{
    freeloop(1);
    .@s$ = "";
    for (.@i = 0; .@i < 200; .@i++)
        .@s$ += charat("abcdefghij", .@i % 10);
    $len = getstrlen(strtoupper(.@s$));
    end;
}"#;

const CALLS: &str = r#"{
    function Fib;
    freeloop(1);
    $fib = Fib(12);
    end;
    function Fib {
        if (getarg(0) < 2)
            return getarg(0);
        return Fib(getarg(0) - 1) + Fib(getarg(0) - 2);
    }
}"#;

fn compile(c: &mut Criterion) {
    let mut engine = ScriptEngine::default();
    c.bench_function("compile_loop", |b| {
        b.iter(|| engine.parse_script(black_box(LOOP), "bench", 1, ParseOptions::NONE))
    });
    c.bench_function("compile_calls", |b| {
        b.iter(|| engine.parse_script(black_box(CALLS), "bench", 1, ParseOptions::NONE))
    });
}

fn execute(c: &mut Criterion) {
    let mut engine = ScriptEngine::default();
    engine.pc_login(Character::new(2000000, 150000, "Bench"));
    for (name, src) in [("run_loop", LOOP), ("run_strings", STRINGS), ("run_calls", CALLS)] {
        let Ok(Some(code)) = engine.parse_script(src, "bench", 1, ParseOptions::NONE) else {
            panic!("{name} failed to compile");
        };
        c.bench_function(name, |b| b.iter(|| engine.run_script(black_box(&code), 0, 2000000, 0)));
    }
}

criterion_group!(benches, compile, execute);
criterion_main!(benches);
