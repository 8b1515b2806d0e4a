extern "C" {
    /// Returns the CPU time stamp counter.
    /// Uses LFENCE for serialization.
    pub fn get_rdtsc() -> u64;

    /// Executes CPUID for `leaf` (sub-leaf 0) and returns EAX.
    /// CPUID is serializing and causes an unconditional VM-exit under VT-x/SVM.
    pub fn issue_cpuid(leaf: u32) -> u32;
}
