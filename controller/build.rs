fn main() {
    // Host builds run without ESP-IDF; only the device firmware links against it.
    if std::env::var_os("CARGO_FEATURE_ESP32").is_none() {
        return;
    }

    embuild::espidf::sysenv::output();
}
