fn main() {
    println!("cargo:rerun-if-env-changed=CVM_UNLOCK_BUILD_STATIC");
    if let Ok(build_static) = std::env::var("CVM_UNLOCK_BUILD_STATIC") {
        if matches!(
            build_static.to_lowercase().as_ref(),
            "1" | "y" | "yes" | "true"
        ) {
            // The agent runs from the initrd before /usr is available.
            println!("cargo:rustc-link-arg=-static");
            println!("cargo:rustc-link-search=/usr/lib");
        }
    }
}
