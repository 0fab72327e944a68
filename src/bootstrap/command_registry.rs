use crate::bootstrap::app_bootstrap::ServerOverrides;
use clap::{Arg, ArgMatches, Command};

/// 构建命令行应用
pub fn build_app() -> Command {
    Command::new("vgo-notify")
        .version(env!("CARGO_PKG_VERSION"))
        .about("实时通知推送服务")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("server")
                .about("启动推送服务")
                .arg(
                    Arg::new("host")
                        .long("host")
                        .value_name("HOST")
                        .help("设置服务器主机地址"),
                )
                .arg(
                    Arg::new("port")
                        .short('p')
                        .long("port")
                        .value_name("PORT")
                        .help("设置服务器端口")
                        .value_parser(clap::value_parser!(u16)),
                )
                .arg(
                    Arg::new("workers")
                        .short('w')
                        .long("workers")
                        .value_name("WORKERS")
                        .help("设置工作线程数")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .help("额外的配置文件（优先级高于 config/ 目录）"),
                ),
        )
        .subcommand(Command::new("version").about("显示版本信息"))
}

/// 从 `server` 子命令读取覆盖项；未给出的参数沿用配置文件
pub fn server_overrides(matches: &ArgMatches) -> ServerOverrides {
    ServerOverrides {
        host: matches.get_one::<String>("host").cloned(),
        port: matches.get_one::<u16>("port").copied(),
        workers: matches.get_one::<usize>("workers").copied(),
        config_file: matches.get_one::<String>("config").cloned(),
    }
}

pub fn print_version() {
    println!("vgo-notify {}", env!("CARGO_PKG_VERSION"));
}
