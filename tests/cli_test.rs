// tests/cli_test.rs
use podbit::cli::build_cli;

#[test]
fn test_cli_basic_structure() {
    let app = build_cli();
    assert_eq!(app.get_name(), "podbit");

    let matches = app.try_get_matches_from(vec!["podbit"]).unwrap();
    assert!(matches.get_one::<String>("queue").is_none());
    assert!(matches.get_one::<String>("data-dir").is_none());
    assert_eq!(matches.get_one::<String>("player").unwrap(), "mpv");
    assert_eq!(matches.get_one::<String>("socket").unwrap(), "/tmp/podbit-mpv");
    assert_eq!(*matches.get_one::<u64>("cache-days").unwrap(), 3);
    assert!(!matches.get_flag("no-clean"));
}

#[test]
fn test_cli_options() {
    let matches = build_cli()
        .try_get_matches_from(vec![
            "podbit",
            "-q",
            "/tmp/queue",
            "--data-dir",
            "/tmp/podbit-data",
            "--player",
            "/usr/local/bin/mpv",
            "--socket",
            "/run/user/1000/mpv",
            "--cache-days",
            "10",
            "--no-clean",
        ])
        .unwrap();

    assert_eq!(matches.get_one::<String>("queue").unwrap(), "/tmp/queue");
    assert_eq!(matches.get_one::<String>("data-dir").unwrap(), "/tmp/podbit-data");
    assert_eq!(matches.get_one::<String>("player").unwrap(), "/usr/local/bin/mpv");
    assert_eq!(matches.get_one::<String>("socket").unwrap(), "/run/user/1000/mpv");
    assert_eq!(*matches.get_one::<u64>("cache-days").unwrap(), 10);
    assert!(matches.get_flag("no-clean"));
}

#[test]
fn test_cli_invalid_values() {
    let result = build_cli().try_get_matches_from(vec!["podbit", "--cache-days", "soon"]);
    assert!(result.is_err());

    let result = build_cli().try_get_matches_from(vec!["podbit", "stray-argument"]);
    assert!(result.is_err());
}
