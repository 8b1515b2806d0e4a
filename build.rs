fn main() {
    cc::Build::new()
        .file("asm/rdtsc.s")
        .file("asm/cpuid.s")
        .compile("vmcheck_asm");

    let target = std::env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=VMCHECK_BUILD_TARGET={}", target);

    println!("cargo:rerun-if-changed=asm/rdtsc.s");
    println!("cargo:rerun-if-changed=asm/cpuid.s");
}
