//! Benchmarks for template lexing, parsing and rendering
//!
//! These benchmarks measure how the engine scales with the size of a
//! model: columns emitted by a loop and the number of references.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sqlweave_core::{Config, ModelDefaults};
use sqlweave_jinja::{lexer, parse_template, BuildOptions, Compiler, File, FileKind, FileSystem};
use std::sync::Arc;

/// Generate a model selecting N columns through a macro, joining M upstream models
fn generate_model(num_columns: usize, num_refs: usize) -> String {
    let columns: Vec<String> = (0..num_columns).map(|i| format!("'col_{}'", i)).collect();
    let mut joins = Vec::new();
    for i in 1..=num_refs {
        joins.push(format!(
            "left join {{{{ ref('upstream_{}') }}}} t{} on t0.id = t{}.id",
            i, i, i
        ));
    }

    format!(
        "{{{{ config(materialized='table', tags=['bench']) }}}}\n\
         {{% set columns = [{}] %}}\n\
         select\n\
         {{% for c in columns %}}  {{{{ cents(c) }}}} as {{{{ c | upper }}}}{{% if not loop.last %}},{{% endif %}}\n\
         {{% endfor %}}from {{{{ ref('upstream_0') }}}} t0\n{}",
        columns.join(", "),
        joins.join("\n")
    )
}

fn project(num_columns: usize, num_refs: usize) -> Compiler {
    let mut fs = FileSystem::new(ModelDefaults::default());
    fs.add(File::new(
        "money",
        "macros/money.sql",
        FileKind::Macro,
        "{% macro cents(col, scale=100) %}({{ col }} / {{ scale }}){% endmacro %}",
    ))
    .unwrap();
    for i in 0..=num_refs {
        let name = format!("upstream_{}", i);
        let path = format!("models/{}.sql", name);
        fs.add(File::new(name.clone(), path, FileKind::Model, "select 1 as id")).unwrap();
    }
    fs.add(File::new(
        "model",
        "models/model.sql",
        FileKind::Model,
        generate_model(num_columns, num_refs),
    ))
    .unwrap();

    Compiler::new(Arc::new(fs), Config::default(), BuildOptions::default())
}

/// Benchmark: tokenize a model (10, 100, 500 columns)
fn bench_lexing(c: &mut Criterion) {
    let mut group = c.benchmark_group("lexing");

    for num_columns in [10, 100, 500].iter() {
        let source = generate_model(*num_columns, 5);
        group.bench_with_input(BenchmarkId::from_parameter(num_columns), num_columns, |b, _| {
            b.iter(|| black_box(lexer::tokenize("models/model.sql", &source)))
        });
    }

    group.finish();
}

/// Benchmark: lex + parse
fn bench_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("parsing");

    for num_columns in [10, 100, 500].iter() {
        let source = generate_model(*num_columns, 5);
        group.bench_with_input(BenchmarkId::from_parameter(num_columns), num_columns, |b, _| {
            b.iter(|| black_box(parse_template("models/model.sql", &source)))
        });
    }

    group.finish();
}

/// Benchmark: executing compile of a parsed model, macros already loaded
fn bench_rendering(c: &mut Criterion) {
    let mut group = c.benchmark_group("rendering");

    for num_refs in [1, 10, 50].iter() {
        let compiler = project(100, *num_refs);
        let model = compiler.files().model("model").unwrap().clone();
        // warm the parse cache and the macro registry
        compiler.compile(&model, true).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(num_refs), num_refs, |b, _| {
            b.iter(|| black_box(compiler.compile(&model, true)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_lexing, bench_parsing, bench_rendering);
criterion_main!(benches);
