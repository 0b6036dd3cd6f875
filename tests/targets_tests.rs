use std::io::Write;

use mqtt_scan_rs::targets::{expand_cidr_to_ips, load_targets};
use mqtt_scan_rs::types::Target;

#[test]
fn reads_targets_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "# brokers").unwrap();
    writeln!(file, "10.0.0.5").unwrap();
    writeln!(file, "10.0.0.6:1884").unwrap();
    writeln!(file).unwrap();
    writeln!(file, "10.0.1.0/30").unwrap();

    let path = file.path().to_str().expect("utf-8 path");
    let targets = load_targets(path, 1883).expect("parse ok");
    assert_eq!(
        targets,
        vec![
            Target::new("10.0.0.5", 1883),
            Target::new("10.0.0.6", 1884),
            Target::new("10.0.1.1", 1883),
            Target::new("10.0.1.2", 1883),
        ]
    );
}

#[test]
fn bad_line_in_file_names_the_line() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "10.0.0.5").unwrap();
    writeln!(file, "10.0.0.6:99999").unwrap();
    let err = load_targets(file.path().to_str().unwrap(), 1883).unwrap_err();
    assert!(format!("{err:#}").contains("line 2"));
}

#[test]
fn non_file_input_is_a_list() {
    let targets = load_targets("broker-a,broker-b:8883", 1883).unwrap();
    assert_eq!(
        targets,
        vec![Target::new("broker-a", 1883), Target::new("broker-b", 8883)]
    );
}

#[test]
fn ipv6_cidr_is_not_expanded() {
    let net: ipnet::IpNet = "fd00::/126".parse().unwrap();
    assert!(expand_cidr_to_ips(net).is_empty());
    assert!(load_targets("fd00::/126", 1883).is_err());
}
