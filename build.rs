//! Build script for ferroring
//!
//! Without the `mpi` feature there is nothing to do. With it, this script
//! locates an MPI installation, compiles the C shim in `csrc/` against it and
//! links the MPI library.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    if std::env::var_os("CARGO_FEATURE_MPI").is_none() {
        return;
    }

    #[cfg(feature = "mpi")]
    shim::build();
}

#[cfg(feature = "mpi")]
mod shim {
    use std::env;
    use std::path::{Path, PathBuf};
    use std::process::Command;

    const SOURCE: &str = "csrc/ferroring_mpi.c";
    const PREFIXES: [&str; 4] = ["/usr", "/usr/local", "/opt/mpich", "/opt/openmpi"];

    /// Where the MPI headers and libraries live.
    #[derive(Default)]
    struct MpiLocation {
        includes: Vec<PathBuf>,
        lib_dirs: Vec<PathBuf>,
        libs: Vec<String>,
        version: Option<String>,
    }

    impl MpiLocation {
        /// From compiler-wrapper flags such as `mpicc -show` prints.
        fn from_flags<'a>(flags: impl Iterator<Item = &'a str>) -> Self {
            let mut location = MpiLocation::default();
            for flag in flags {
                if let Some(dir) = flag.strip_prefix("-I") {
                    location.includes.push(dir.into());
                } else if let Some(dir) = flag.strip_prefix("-L") {
                    location.lib_dirs.push(dir.into());
                } else if let Some(lib) = flag.strip_prefix("-l") {
                    location.libs.push(lib.to_owned());
                }
            }
            if location.libs.is_empty() {
                location.libs.push("mpi".to_owned());
            }
            location
        }

        /// A conventional `include/` + `lib*/` installation tree.
        fn under(prefix: &Path) -> Option<Self> {
            if !prefix.join("include/mpi.h").exists() {
                return None;
            }
            let lib_dir = ["lib64", "lib"]
                .iter()
                .map(|d| prefix.join(d))
                .find(|d| d.is_dir())?;
            Some(MpiLocation {
                includes: vec![prefix.join("include")],
                lib_dirs: vec![lib_dir],
                libs: vec!["mpi".to_owned()],
                version: None,
            })
        }
    }

    fn from_pkg_config(name: &str) -> Option<MpiLocation> {
        let lib = pkg_config::Config::new()
            .cargo_metadata(false)
            .probe(name)
            .ok()?;
        Some(MpiLocation {
            includes: lib.include_paths,
            lib_dirs: lib.link_paths,
            libs: lib.libs,
            version: Some(lib.version),
        })
    }

    fn from_wrapper() -> Option<MpiLocation> {
        let wrapper = env::var("MPICC").unwrap_or_else(|_| "mpicc".to_owned());
        let output = Command::new(&wrapper).arg("-show").output().ok()?;
        if !output.status.success() {
            return None;
        }
        let shown = String::from_utf8_lossy(&output.stdout);
        Some(MpiLocation::from_flags(shown.split_whitespace()))
    }

    fn locate() -> MpiLocation {
        let named = env::var("MPI_PKG_CONFIG").ok();
        let probes = named
            .iter()
            .map(String::as_str)
            .chain(["mpich", "ompi", "mpi"]);
        for name in probes {
            if let Some(location) = from_pkg_config(name) {
                eprintln!("ferroring: MPI from pkg-config package {name}");
                return location;
            }
        }

        if let Some(location) = from_wrapper() {
            eprintln!("ferroring: MPI from compiler wrapper flags");
            return location;
        }

        let cray = env::var_os("CRAY_MPICH_DIR").map(PathBuf::from);
        for prefix in cray.into_iter().chain(PREFIXES.iter().map(PathBuf::from)) {
            if let Some(location) = MpiLocation::under(&prefix) {
                eprintln!("ferroring: MPI under {}", prefix.display());
                return location;
            }
        }

        panic!(
            "the `mpi` feature needs an MPI installation (MPICH or Open MPI). \
             Point MPI_PKG_CONFIG at its pkg-config package, put mpicc on PATH \
             (or set MPICC), or set CRAY_MPICH_DIR."
        );
    }

    pub fn build() {
        println!("cargo:rerun-if-changed={SOURCE}");
        println!("cargo:rerun-if-changed=csrc/ferroring_mpi.h");
        for var in ["MPI_PKG_CONFIG", "MPICC", "CRAY_MPICH_DIR"] {
            println!("cargo:rerun-if-env-changed={var}");
        }

        let mpi = locate();

        let mut cc = cc::Build::new();
        cc.file(SOURCE).include("csrc").warnings(true).extra_warnings(true);
        cc.includes(&mpi.includes);
        if env::var("PROFILE").as_deref() == Ok("release") {
            cc.opt_level(3);
        }
        cc.compile("ferroring_mpi");

        for dir in &mpi.lib_dirs {
            println!("cargo:rustc-link-search=native={}", dir.display());
            println!("cargo:rustc-link-arg=-Wl,-rpath,{}", dir.display());
        }
        for lib in &mpi.libs {
            println!("cargo:rustc-link-lib={lib}");
        }
        if let Some(version) = &mpi.version {
            println!("cargo:rustc-env=FERRORING_MPI_VERSION={version}");
        }
    }
}
