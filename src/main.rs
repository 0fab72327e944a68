use clap::ArgMatches;
use std::error::Error;
use vgo_notify::bootstrap::{build_app, print_version, server_overrides, AppBootstrap};

#[actix_web::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let matches: ArgMatches = build_app().get_matches();

    match matches.subcommand() {
        Some(("server", sub_matches)) => {
            AppBootstrap::new()
                .with_overrides(server_overrides(sub_matches))
                .run()
                .await?;
        }
        Some(("version", _)) => {
            print_version();
        }
        _ => {
            // subcommand_required(true) 保证不会到达这里
            eprintln!("未知命令，请使用 --help 查看可用命令");
            std::process::exit(1);
        }
    }

    Ok(())
}
