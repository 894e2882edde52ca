fn main() {
    qcc::compiler_main();
}
