//! Startup banner

use super::config::is_all_interfaces;
use super::constants::APP_NAME;

/// Label column width
const W: usize = 12;

/// One line per pipeline in the banner
pub struct BannerPipeline<'a> {
    pub name: &'a str,
    pub endpoint: &'a str,
    pub pending: usize,
}

/// Print the startup banner with endpoints and pipelines
pub fn print_banner(
    host: &str,
    port: u16,
    grpc_port: Option<u16>,
    data_dir: &str,
    pipelines: &[BannerPipeline<'_>],
) {
    let shown_host = display_host(host);
    let base_url = format!("http://{}:{}", shown_host, port);

    println!();
    println!(
        "  \x1b[1m\x1b[36m{}\x1b[0m \x1b[90mv{}\x1b[0m",
        APP_NAME,
        env!("CARGO_PKG_VERSION")
    );
    println!();

    println!(
        "  \x1b[33m➜\x1b[0m  \x1b[1m{:<W$}\x1b[0m {}/v1/{{traces,metrics,logs}}",
        "OTLP HTTP:", base_url
    );
    if let Some(grpc_port) = grpc_port {
        println!(
            "  \x1b[33m➜\x1b[0m  \x1b[1m{:<W$}\x1b[0m {}:{}",
            "OTLP gRPC:", shown_host, grpc_port
        );
    }
    println!(
        "  \x1b[32m➜\x1b[0m  \x1b[1m{:<W$}\x1b[0m {}",
        "Stats:",
        terminal_link(&format!("{}/api/v1/stats", base_url))
    );

    if host == "127.0.0.1" || host == "localhost" {
        println!("  \x1b[90m➜  {:<W$} use --host 0.0.0.0 to expose\x1b[0m", "Network:");
    } else if is_all_interfaces(host) {
        if let Ok(interfaces) = local_ip_address::list_afinet_netifas() {
            for (_, ip) in interfaces
                .iter()
                .filter(|(_, ip)| ip.is_ipv4() && !ip.is_loopback())
            {
                println!(
                    "  \x1b[32m➜\x1b[0m  \x1b[1m{:<W$}\x1b[0m {}",
                    "Network:",
                    terminal_link(&format!("http://{}:{}", ip, port))
                );
            }
        }
    }

    for pipeline in pipelines {
        let pending = if pipeline.pending > 0 {
            format!(" \x1b[33m({} pending)\x1b[0m", pipeline.pending)
        } else {
            String::new()
        };
        println!(
            "  \x1b[35m➜\x1b[0m  \x1b[1m{:<W$}\x1b[0m {}{}",
            format!("{}:", pipeline.name),
            pipeline.endpoint,
            pending
        );
    }
    println!("  \x1b[90m➜  {:<W$} {}\x1b[0m", "Data:", data_dir);
    println!();
}

/// Host to show in URLs: a wildcard bind is reachable via localhost
fn display_host(host: &str) -> &str {
    if is_all_interfaces(host) {
        "localhost"
    } else {
        host
    }
}

/// Clickable OSC 8 hyperlink where the terminal supports it, cyan text
/// otherwise
fn terminal_link(url: &str) -> String {
    if supports_hyperlinks::on(supports_hyperlinks::Stream::Stdout) {
        format!("\x1b]8;;{}\x07\x1b[36m{}\x1b[0m\x1b]8;;\x07", url, url)
    } else {
        format!("\x1b[36m{}\x1b[0m", url)
    }
}
