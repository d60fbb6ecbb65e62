use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    // Read VERSION file
    let version_file = fs::read_to_string("VERSION")
        .expect("VERSION file not found - run: echo '0.9.0' > VERSION");

    let version = version_file.trim();
    let cargo_version = env!("CARGO_PKG_VERSION");

    if version != cargo_version {
        panic!(
            "\n\n\
            ❌ VERSION MISMATCH!\n\
            VERSION file: {}\n\
            Cargo.toml:   {}\n\n\
            Update VERSION to match Cargo.toml\n\n",
            version, cargo_version
        );
    }

    // Reported by the GET_VERSION control message.
    let built_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=OFFLINE_KIT_BUILD_TIMESTAMP={}", built_at);

    println!("cargo:rerun-if-changed=VERSION");
}
