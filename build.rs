// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn transaction_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("nodeps")
            .long("nodeps")
            .action(ArgAction::SetTrue)
            .help("Skip dependency checks"),
    )
    .arg(
        Arg::new("dbonly")
            .long("dbonly")
            .action(ArgAction::SetTrue)
            .help("Only modify database entries, not package files"),
    )
    .arg(
        Arg::new("force")
            .long("force")
            .action(ArgAction::SetTrue)
            .help("Bypass version checks"),
    )
}

fn build_cli() -> Command {
    Command::new("pacflow")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Pacflow Contributors")
        .about("Package transaction front end with progress events")
        .subcommand_required(false)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .default_value("/etc/pacflow.toml")
                .help("Configuration file"),
        )
        .arg(
            Arg::new("catalog")
                .long("catalog")
                .value_name("PATH")
                .help("Package catalog (default: <db_path>/catalog.json)"),
        )
        .arg(
            Arg::new("diagnostic_log")
                .long("diagnostic-log")
                .value_name("PATH")
                .help("Write raw engine log lines to this file"),
        )
        .arg(
            Arg::new("detached")
                .long("detached")
                .action(ArgAction::SetTrue)
                .help("Run without an event consumer"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Print events and query results as JSON"),
        )
        .subcommand(transaction_args(
            Command::new("install")
                .about("Install packages or groups from the sync repositories")
                .arg(Arg::new("names").required(true).num_args(1..).help("Package or group names"))
                .arg(
                    Arg::new("conflict")
                        .long("conflict")
                        .value_name("NAME")
                        .action(ArgAction::Append)
                        .help("Never install this package"),
                )
                .arg(
                    Arg::new("needed")
                        .long("needed")
                        .action(ArgAction::SetTrue)
                        .help("Skip targets that are already up to date"),
                )
                .arg(
                    Arg::new("asdeps")
                        .long("asdeps")
                        .action(ArgAction::SetTrue)
                        .help("Mark targets as installed as dependencies"),
                )
                .arg(
                    Arg::new("asexplicit")
                        .long("asexplicit")
                        .action(ArgAction::SetTrue)
                        .help("Mark targets as explicitly installed"),
                )
                .arg(
                    Arg::new("downloadonly")
                        .long("downloadonly")
                        .action(ArgAction::SetTrue)
                        .help("Retrieve packages without installing them"),
                ),
        ))
        .subcommand(transaction_args(
            Command::new("upgrade")
                .about("Install or upgrade from package archives")
                .arg(Arg::new("paths").required(true).num_args(1..).help("Package archive paths")),
        ))
        .subcommand(transaction_args(
            Command::new("remove")
                .about("Remove installed packages")
                .arg(Arg::new("names").required(true).num_args(1..).help("Package names"))
                .arg(
                    Arg::new("cascade")
                        .long("cascade")
                        .action(ArgAction::SetTrue)
                        .help("Also remove packages that depend on the targets"),
                )
                .arg(
                    Arg::new("recursive")
                        .short('s')
                        .long("recursive")
                        .action(ArgAction::Count)
                        .help("Remove unneeded dependencies; twice to recurse"),
                )
                .arg(
                    Arg::new("unneeded")
                        .long("unneeded")
                        .action(ArgAction::SetTrue)
                        .help("Also remove explicitly installed dependencies"),
                )
                .arg(
                    Arg::new("nosave")
                        .long("nosave")
                        .action(ArgAction::SetTrue)
                        .help("Do not keep backups of configuration files"),
                ),
        ))
        .subcommand(Command::new("refresh").about("Refresh every sync database"))
        .subcommand(
            Command::new("info")
                .about("Show package details from the sync repositories")
                .arg(Arg::new("names").num_args(0..).help("Package names (all packages if omitted)")),
        )
        .subcommand(
            Command::new("query")
                .about("Check whether a package is installed")
                .arg(Arg::new("name").required(true).help("Package name")),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("pacflow.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
