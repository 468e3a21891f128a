//! Compiles the tiny native fixture under `tests/fixtures/` into a
//! shared library the integration tests load with `load_library`, a
//! throwaway target exercising the wire protocol end to end.

fn main() {
    let source = "tests/fixtures/fixture.c";
    println!("cargo:rerun-if-changed={source}");

    let out_dir = std::env::var("OUT_DIR").expect("OUT_DIR not set");
    let destination = format!("{out_dir}/libfixture.so");

    let compiler = cc::Build::new().get_compiler();
    let mut command = compiler.to_command();
    let status = command
        .arg("-shared")
        .arg("-fPIC")
        .arg("-o")
        .arg(&destination)
        .arg(source)
        .status();

    match status {
        Ok(status) if status.success() => {}
        Ok(status) => panic!("building the test fixture library exited with {status}"),
        Err(err) => {
            // No C toolchain on this machine; the integration tests that
            // need `libfixture.so` skip themselves when it's missing.
            println!("cargo:warning=could not invoke C compiler for test fixtures: {err}");
        }
    }
}
