//! Schema fuzz target: feed arbitrary text to the `.ksy` compiler and the expression parser,
//! then decode a fixed buffer with whatever compiles. Nothing may panic.
//! Build with: cargo fuzz run schema_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    let s = match std::str::from_utf8(data) {
        Ok(x) => x,
        Err(_) => return,
    };
    let _ = ksinspect::expr::parse_expr(s);
    if let Ok(def) = ksinspect::compile_str("fuzz", s) {
        let def = std::sync::Arc::new(def);
        let bytes = [0u8, 1, 2, 3, 0xff, 0x7f, 0x80, 0x00, 0x10, 0x20];
        let _ = ksinspect::decode(
            &def,
            ksinspect::ByteSource::new(&bytes),
            &ksinspect::DecodeOptions::default(),
        );
    }
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run schema_fuzz");
}
