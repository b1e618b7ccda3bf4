fn main() {
    // Link arguments and cfgs exported by esp-idf-sys; only present for the firmware build.
    if std::env::var_os("CARGO_FEATURE_ESP32").is_some() {
        embuild::espidf::sysenv::output();
    }
}
