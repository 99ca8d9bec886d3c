use criterion::{black_box, criterion_group, criterion_main, Criterion};
use warden_compiler::lexer::Lexer;
use warden_compiler::token::Token;

const SAMPLE: &str = r#"
local function fib(n)
    if n < 2 then return n end
    return fib(n - 1) + fib(n - 2)
end
local acc = {}
for i = 1, 30 do
    acc[i] = fib(i) .. "-done"
end
return #acc
"#;

fn bench_lexer(c: &mut Criterion) {
    c.bench_function("lex_sample", |b| {
        b.iter(|| {
            let mut lexer = Lexer::new(black_box(SAMPLE.as_bytes()));
            let mut count = 0usize;
            loop {
                let tok = lexer.advance().unwrap();
                if tok.token == Token::Eof {
                    break;
                }
                count += 1;
            }
            count
        })
    });
}

fn bench_compile(c: &mut Criterion) {
    c.bench_function("compile_sample", |b| {
        b.iter(|| warden_compiler::compile(black_box(SAMPLE.as_bytes()), "bench").unwrap())
    });
}

criterion_group!(benches, bench_lexer, bench_compile);
criterion_main!(benches);
