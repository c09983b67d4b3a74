//! Colorful console output for dispatch activity.

use num_format::{Locale, ToFormattedString};
use owo_colors::OwoColorize;

use crate::config::DispatchConfig;
use crate::coordinator::{BatchAssignment, ClusteringResult};
use crate::domain::RouteGroupId;
use crate::sequencer::{Confidence, RouteSequence};

/// ASCII art banner for server startup.
pub fn print_banner() {
    let banner = r#"
   ____                _             ____  _                 _       _
  / ___|___  _   _ _ __(_) ___ _ __ |  _ \(_)___ _ __   __ _| |_ ___| |__
 | |   / _ \| | | | '__| |/ _ \ '__|| | | | / __| '_ \ / _` | __/ __| '_ \
 | |__| (_) | |_| | |  | |  __/ |   | |_| | \__ \ |_) | (_| | || (__| | | |
  \____\___/ \__,_|_|  |_|\___|_|   |____/|_|___/ .__/ \__,_|\__\___|_| |_|
                                                |_|
"#;
    println!("{}", banner.cyan().bold());
    println!(
        "  {} {}\n",
        format!("v{}", env!("CARGO_PKG_VERSION")).bright_black(),
        "Courier Dispatch".bright_cyan()
    );
}

/// Prints the effective configuration.
pub fn print_config(config: &DispatchConfig, store: &str, provider: &str) {
    println!(
        "{} {} {} Store ({}), distance provider ({}), listening on ({}:{})",
        timestamp().bright_black(),
        "INFO".bright_green(),
        "[Dispatch]".bright_cyan(),
        store.white().bold(),
        provider.white().bold(),
        config.server.host,
        config.server.port.to_string().yellow()
    );
    println!(
        "{} {} {} Locks: ttl ({}s, {}..{}s), batch limit ({}), sweep every ({}s)",
        timestamp().bright_black(),
        "INFO".bright_green(),
        "[Locks]".bright_cyan(),
        config.locks.default_ttl_secs.to_string().yellow(),
        config.locks.min_ttl_secs,
        config.locks.max_ttl_secs,
        config.locks.max_batch_size.to_formatted_string(&Locale::en).bright_yellow(),
        config.locks.sweep_interval_secs
    );
    println!(
        "{} {} {} Cache: precision ({} dp), capacity ({}), distance ttl ({})",
        timestamp().bright_black(),
        "INFO".bright_green(),
        "[Distance]".bright_cyan(),
        config.cache.precision,
        config.cache.max_entries.to_formatted_string(&Locale::en).bright_yellow(),
        format_secs(config.cache.distance_ttl_secs).yellow()
    );
}

/// Prints a clustering summary.
pub fn print_clustering(result: &ClusteringResult) {
    let orders: usize = result.groups.iter().map(|g| g.cluster.order_ids.len()).sum();
    println!(
        "{} {} {} Clustered orders ({}) into groups ({}), geocoded ({}), still missing coordinates ({})",
        timestamp().bright_black(),
        "INFO".bright_green(),
        "[Cluster]".bright_cyan(),
        orders.to_formatted_string(&Locale::en).bright_yellow(),
        result.groups.len().to_formatted_string(&Locale::en).bright_yellow(),
        result.geocoded.len().to_string().white(),
        missing_count(result.needs_geocoding.len())
    );

    for group in &result.groups {
        let radius = format!("{:.2}km", group.cluster.max_radius_km);
        println!(
            "    {} {} │ {:>3} orders │ radius {} │ ~{:.1}km",
            "→".bright_blue(),
            short_id(group.route_group_id).bright_black(),
            group.cluster.order_ids.len(),
            if group.cluster.within_radius {
                radius.green().to_string()
            } else {
                radius.bright_red().to_string()
            },
            group.cluster.estimated_distance_km
        );
    }
}

/// Prints a sequenced route.
pub fn print_route(group_id: RouteGroupId, route: &RouteSequence) {
    let confidence = match route.confidence {
        Confidence::High => "high".bright_green().to_string(),
        Confidence::Low => "low".yellow().to_string(),
    };
    println!(
        "{} {} {} Route {} sequenced: stops ({}), distance ({}), duration ({}), saved ({}), confidence ({}){}",
        timestamp().bright_black(),
        "INFO".bright_green(),
        "[Route]".bright_cyan(),
        short_id(group_id).bright_black(),
        route.sequence.len().to_string().bright_yellow(),
        format!("{:.2}km", route.total_distance_km).yellow(),
        format!("{}min", route.display_duration_minutes).yellow(),
        format!("{:.1}%", route.improvement_percentage).bright_magenta().bold(),
        confidence,
        if route.budget_exhausted {
            " [budget exhausted]".bright_black().to_string()
        } else {
            String::new()
        }
    );
}

/// Prints a committed batch assignment.
pub fn print_batch_assigned(assignment: &BatchAssignment) {
    println!(
        "{} {} {} Courier ({}) assigned orders ({}) in group {}",
        timestamp().bright_black(),
        "INFO".bright_green(),
        "[Dispatch]".bright_cyan(),
        assignment.courier_id.to_string().white().bold(),
        assignment.assigned_order_ids.len().to_string().bright_yellow(),
        short_id(assignment.route_group_id).bright_black()
    );
    if let Some(route) = &assignment.route {
        print_route(assignment.route_group_id, route);
    }
}

fn missing_count(n: usize) -> String {
    if n == 0 {
        n.to_string().white().to_string()
    } else {
        n.to_formatted_string(&Locale::en).bright_red().to_string()
    }
}

fn short_id(id: RouteGroupId) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Formats a number of seconds with the largest whole unit.
fn format_secs(secs: u64) -> String {
    if secs >= 86_400 && secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Returns a timestamp string.
fn timestamp() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| {
            let secs = d.as_secs();
            let millis = d.subsec_millis();
            format!("{}.{:03}", secs, millis)
        })
        .unwrap_or_else(|_| "0.000".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_secs() {
        assert_eq!(format_secs(21_600), "6h");
        assert_eq!(format_secs(2_592_000), "30d");
        assert_eq!(format_secs(90), "90s");
        assert_eq!(format_secs(120), "2m");
    }

    #[test]
    fn test_short_id() {
        let id = uuid::Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(short_id(id), "67e55044");
    }
}
