use std::fs;
use std::sync::Arc;
use std::thread;

use devbox_core::ProvisionError;
use devbox_proxy::{RouteManager, RouteSettings};
use tempfile::tempdir;

fn manager(dir: &std::path::Path) -> RouteManager {
    RouteManager::new(dir.join("dynamic").join("devbox.yml"), RouteSettings::default())
}

#[test]
fn test_add_route_writes_router_and_service() {
    let dir = tempdir().expect("tempdir");
    let routes = manager(dir.path());

    let url = routes
        .add_route("dev1-acme.ws.example.com", 8100)
        .expect("add route");
    assert_eq!(url, "https://dev1-acme.ws.example.com");
    assert_eq!(
        routes.route_for("dev1-acme.ws.example.com").unwrap(),
        Some(8100)
    );

    let written = fs::read_to_string(routes.config_path()).expect("config written");
    assert!(written.contains("Host(`dev1-acme.ws.example.com`)"));
    assert!(written.contains("http://127.0.0.1:8100"));
    assert!(written.contains("certResolver: letsencrypt"));
    assert!(written.contains("websecure"));
}

#[test]
fn test_update_route_swaps_port_in_place() {
    let dir = tempdir().expect("tempdir");
    let routes = manager(dir.path());

    routes.add_route("a.example.com", 8100).unwrap();
    routes.add_route("b.example.com", 8101).unwrap();
    routes.update_route("a.example.com", 8150).unwrap();

    let all = routes.routes().unwrap();
    assert_eq!(all.get("a.example.com"), Some(&8150));
    assert_eq!(all.get("b.example.com"), Some(&8101));
    assert_eq!(all.len(), 2);
}

#[test]
fn test_remove_route_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let routes = manager(dir.path());

    routes.add_route("a.example.com", 8100).unwrap();
    assert!(routes.remove_route("a.example.com").unwrap());
    assert!(!routes.remove_route("a.example.com").unwrap());
    assert!(!routes.remove_route("never.example.com").unwrap());
    assert_eq!(routes.route_for("a.example.com").unwrap(), None);
}

#[test]
fn test_invalid_hostname_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let routes = manager(dir.path());

    let err = routes.add_route("bad host`)", 8100).unwrap_err();
    assert!(matches!(err, ProvisionError::RouteRegistration { port: 8100, .. }));
    assert!(!routes.config_path().exists());
}

#[test]
fn test_foreign_routes_are_preserved() {
    let dir = tempdir().expect("tempdir");
    let routes = manager(dir.path());
    fs::create_dir_all(routes.config_path().parent().unwrap()).unwrap();
    fs::write(
        routes.config_path(),
        r#"
http:
  routers:
    dashboard:
      rule: Host(`proxy.example.com`)
      service: api@internal
      entryPoints: [websecure]
"#,
    )
    .unwrap();

    routes.add_route("a.example.com", 8100).unwrap();
    routes.remove_route("a.example.com").unwrap();

    let written = fs::read_to_string(routes.config_path()).unwrap();
    assert!(written.contains("dashboard"));
    assert!(written.contains("api@internal"));
    // Unmanaged routers are not reported as workspace routes.
    assert!(routes.routes().unwrap().is_empty());
}

#[test]
fn test_concurrent_writers_do_not_lose_routes() {
    let dir = tempdir().expect("tempdir");
    let routes = Arc::new(manager(dir.path()));
    let config_path = routes.config_path().to_path_buf();

    let handles: Vec<_> = (0..20u16)
        .map(|i| {
            // Half the writers share the manager, half use their own instance.
            let shared = Arc::clone(&routes);
            let path = config_path.clone();
            thread::spawn(move || {
                let hostname = format!("ws{i}.example.com");
                if i % 2 == 0 {
                    shared.add_route(&hostname, 8100 + i)
                } else {
                    RouteManager::new(path, RouteSettings::default()).add_route(&hostname, 8100 + i)
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread").expect("add route");
    }

    let all = routes.routes().unwrap();
    assert_eq!(all.len(), 20);
    for i in 0..20u16 {
        assert_eq!(all.get(&format!("ws{i}.example.com")), Some(&(8100 + i)));
    }
}
