// cancapture/build.rs
//
// Build script for the 'cancapture' library.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=build.rs");
    match std::env::var("CARGO_CFG_TARGET_OS") {
        Ok(val) if val == "linux" => Ok(()),
        _ => Err("SocketCAN capture is only available on Linux; cancapture can't be built for this target".into()),
    }
}
