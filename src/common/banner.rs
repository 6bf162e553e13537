const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

macro_rules! env_or {
    ($key:literal, $default:literal) => {
        option_env!($key).unwrap_or($default)
    };
}

pub struct BannerInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub branch: &'static str,
    pub profile: &'static str,
}

impl Default for BannerInfo {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            commit: env_or!("GIT_COMMIT", "unknown"),
            branch: env_or!("GIT_BRANCH", "unknown"),
            profile: if cfg!(debug_assertions) {
                "debug"
            } else {
                "release"
            },
        }
    }
}

pub fn print_banner(info: &BannerInfo) {
    println!();
    println!("{RED}   _    __      __                  _     {RESET}");
    println!("{RED}  | |  / /___  / /________ _____  (_)____ {RESET}");
    println!("{RED}  | | / / __ \\/ / ___/ __ `/ __ \\/ / ___/ {RESET}");
    println!("{RED}  | |/ / /_/ / / /__/ /_/ / / / / / /__   {RESET}");
    println!("{RED}  |___/\\____/_/\\___/\\__,_/_/ /_/_/\\___/   {RESET}");
    println!("{DIM}  ========================================{RESET}");
    println!();
    print_row("Version", info.version);
    print_row("Branch", info.branch);
    print_row("Commit", info.commit);
    print_row("Profile", info.profile);
    println!();
    println!("{DIM}  Speaking Lavalink v3 {YELLOW}(Is-Volcano: true){RESET}");
    println!();
}

fn print_row(label: &str, value: &str) {
    println!("  {BOLD}{label:<10}{RESET}{value}");
}
