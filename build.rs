fn main() {
    // Enables static linking of the vcruntime library on Windows builds so the
    // binary can be dropped onto a database host without a runtime installer
    static_vcruntime::metabuild();
}
