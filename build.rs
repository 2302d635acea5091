//! Development-aid build script.
//!
//! The crate's actual context-switch routines are `core::arch::naked_asm!`
//! blocks in `src/arch/`, compiled directly by rustc — no build step is
//! required for the normal build. When the `assemble_at_build` feature is
//! enabled, this script additionally shells out to the platform C
//! compiler to assemble the hand-written mirror sources in `asm/` and
//! drops the extracted `.text` bytes next to them, purely so a developer
//! can diff the two independently-authored descriptions of the switch
//! routine against each other. Nothing produced here is linked into the
//! crate.

use std::env;
use std::path::Path;

fn main() {
    println!("cargo::rerun-if-changed=asm/x86_64_unix.s");
    println!("cargo::rerun-if-changed=asm/x86_64_windows.s");

    if env::var_os("CARGO_FEATURE_ASSEMBLE_AT_BUILD").is_none() {
        return;
    }

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let source = if target_os == "windows" { "asm/x86_64_windows.s" } else { "asm/x86_64_unix.s" };
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR set by cargo");

    let mut build = cc::Build::new();
    build.file(source);
    build.flag_if_supported("-c");

    // We only want the assembled object for its bytes, not to link it
    // into this crate (the actual switch routine stays the `naked_asm!`
    // one). Compile it into the build script's own scratch directory and
    // leave it there for manual inspection (`objdump -d`).
    let obj_path = Path::new(&out_dir).join("reference_switch.o");
    build.get_compiler();
    let mut cmd = build.get_compiler().to_command();
    cmd.arg("-c").arg(source).arg("-o").arg(&obj_path);

    match cmd.status() {
        Ok(status) if status.success() => {
            println!(
                "cargo::warning=assembled reference object at {} for manual comparison against naked_asm! output",
                obj_path.display()
            );
        }
        Ok(status) => {
            println!("cargo::warning=reference assembler exited with {status}; skipping dev-aid comparison");
        }
        Err(e) => {
            println!("cargo::warning=could not invoke reference assembler: {e}; skipping dev-aid comparison");
        }
    }
}
