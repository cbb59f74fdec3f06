use chrono::{Duration, TimeZone, Utc};
use community_gate::{
    clock::ManualClock,
    config::{Config, ConfigError},
    database::{ApiKeyStore, Database, MemoryApiKeyStore},
    errors::ApiError,
    models::{
        ApiKeyFilter, ApiKeyStatus, CreateApiKeyRequest, Pagination, RateLimitPolicy,
        Restrictions, Revocation,
    },
    permissions::{has_permission, Permission},
    security::{hash_api_key, AdminTokenService, ApiKeyService},
};
use std::sync::Arc;

fn service_with(store: Arc<dyn ApiKeyStore>) -> (Arc<ManualClock>, ApiKeyService) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    ));
    let service =
        ApiKeyService::with_clock(store, "lcp".to_string(), "test".to_string(), clock.clone());
    (clock, service)
}

fn memory_service() -> (Arc<ManualClock>, ApiKeyService) {
    service_with(Arc::new(MemoryApiKeyStore::new()))
}

fn request(name: &str, permissions: &[&str]) -> CreateApiKeyRequest {
    CreateApiKeyRequest {
        name: Some(name.to_string()),
        permissions: Some(permissions.iter().map(|p| p.to_string()).collect()),
        ..Default::default()
    }
}

fn perms(scopes: &[&str]) -> Vec<Permission> {
    scopes.iter().map(|s| s.parse().unwrap()).collect()
}

#[test]
fn test_permission_parsing() {
    assert_eq!("*".parse::<Permission>().unwrap(), Permission::Global);
    assert_eq!(
        "admin:*".parse::<Permission>().unwrap(),
        Permission::Prefix("admin".to_string())
    );
    assert_eq!(
        "api:read".parse::<Permission>().unwrap(),
        Permission::Exact("api:read".to_string())
    );
    assert!(":*".parse::<Permission>().is_err());
    assert!("api:re*d".parse::<Permission>().is_err());
    assert!(Permission::parse_known("billing:read").is_err());
    assert_eq!(Permission::Prefix("internal".into()).to_string(), "internal:*");
}

#[test]
fn test_permission_matching() {
    let read_only = perms(&["api:read"]);
    assert!(has_permission(&read_only, "api:read"));
    assert!(!has_permission(&read_only, "api:write"));
    assert!(!has_permission(&read_only, "admin:read"));

    let admin = perms(&["admin:*"]);
    assert!(has_permission(&admin, "admin:read"));
    assert!(has_permission(&admin, "admin:write"));
    assert!(has_permission(&admin, "admin:*"));
    assert!(!has_permission(&admin, "api:read"));
    // 名前空間の一部一致では許可しない
    assert!(!has_permission(&admin, "administrator:read"));

    let global = perms(&["*"]);
    for required in ["api:read", "api:write", "admin:read", "internal:jobs", "*"] {
        assert!(has_permission(&global, required));
    }
}

#[test]
fn test_permission_serializes_as_string() {
    let json = serde_json::to_string(&perms(&["api:read", "admin:*", "*"])).unwrap();
    assert_eq!(json, r#"["api:read","admin:*","*"]"#);
    let back: Vec<Permission> = serde_json::from_str(&json).unwrap();
    assert_eq!(back, perms(&["api:read", "admin:*", "*"]));
}

#[test]
fn test_rate_limit_policy_strictness() {
    let route = RateLimitPolicy::per_minute(100);
    assert!(RateLimitPolicy::per_minute(10).is_stricter_than(&route));
    assert!(!RateLimitPolicy::per_minute(100).is_stricter_than(&route));
    // 10 per second is looser than 100 per minute
    assert!(!RateLimitPolicy::new(10, 1_000).is_stricter_than(&route));
    assert!(RateLimitPolicy::new(100, 120_000).is_stricter_than(&route));
}

#[test]
fn test_restrictions_allow_ip() {
    assert!(Restrictions::default().allows_ip("10.0.0.1"));
    let restricted = Restrictions {
        allowed_ips: vec!["10.0.0.1".to_string()],
        ..Default::default()
    };
    assert!(restricted.allows_ip("10.0.0.1"));
    assert!(!restricted.allows_ip("10.0.0.2"));
}

#[test]
fn test_generated_key_format() {
    let (_clock, service) = memory_service();
    let (key, hash) = service.generate_api_key();

    assert!(key.starts_with("lcp_test_v1_"));
    assert_eq!(key.split('_').count(), 6);
    assert_eq!(hash, hash_api_key(&key));
    assert_eq!(hash.len(), 64);
    assert!(service.validate_api_key_format(&key).is_ok());

    let (other, _) = service.generate_api_key();
    assert_ne!(key, other);
}

#[test]
fn test_tampered_key_fails_checksum() {
    let (_clock, service) = memory_service();
    let (key, _) = service.generate_api_key();

    let mut parts: Vec<String> = key.split('_').map(str::to_string).collect();
    let random = &mut parts[4];
    let replacement = if random.starts_with('A') { "B" } else { "A" };
    random.replace_range(0..1, replacement);
    let tampered = parts.join("_");

    assert!(matches!(
        service.validate_api_key_format(&tampered),
        Err(ApiError::InvalidChecksum)
    ));
    assert!(matches!(
        service.validate_api_key_format("lcp_test_v1_garbage"),
        Err(ApiError::InvalidKeyFormat)
    ));
    assert!(matches!(
        service.validate_api_key_format(&key.replacen("lcp", "xyz", 1)),
        Err(ApiError::InvalidKeyFormat)
    ));
}

#[test]
fn test_create_api_key_validation() {
    let (_clock, service) = memory_service();

    let missing_name = CreateApiKeyRequest {
        permissions: Some(vec!["api:read".into()]),
        ..Default::default()
    };
    assert!(matches!(
        service.create_api_key(missing_name, "admin"),
        Err(ApiError::InvalidRequest(_))
    ));

    let missing_permissions = CreateApiKeyRequest {
        name: Some("svc".into()),
        ..Default::default()
    };
    assert!(matches!(
        service.create_api_key(missing_permissions, "admin"),
        Err(ApiError::InvalidRequest(_))
    ));

    assert!(matches!(
        service.create_api_key(request("svc", &[]), "admin"),
        Err(ApiError::InvalidRequest(_))
    ));
    assert!(matches!(
        service.create_api_key(request("svc", &["api:delete"]), "admin"),
        Err(ApiError::InvalidRequest(_))
    ));

    let zero_rate = CreateApiKeyRequest {
        rate_limit: Some(RateLimitPolicy::new(0, 60_000)),
        ..request("svc", &["api:read"])
    };
    assert!(matches!(
        service.create_api_key(zero_rate, "admin"),
        Err(ApiError::InvalidRequest(_))
    ));

    // 何も保存されていない
    let page = service
        .list_api_keys(ApiKeyFilter::default(), Pagination::default())
        .unwrap();
    assert_eq!(page.total, 0);
}

#[test]
fn test_create_and_authenticate() {
    let (_clock, service) = memory_service();
    let created = service
        .create_api_key(request("svc", &["api:read", "api:read"]), "admin")
        .unwrap();

    let key = service.authenticate(&created.api_key).unwrap();
    assert_eq!(key.id, created.key_id);
    assert_eq!(key.status, ApiKeyStatus::Active);
    assert_eq!(key.permissions, perms(&["api:read"]));
    assert_eq!(key.created_by, "admin");
    assert_eq!(key.key_hash, hash_api_key(&created.api_key));
    assert_ne!(key.key_hash, created.api_key);
    assert_eq!(key.usage_count, 1);

    assert!(ApiKeyService::has_permission(&key, "api:read"));
    assert!(!ApiKeyService::has_permission(&key, "api:write"));

    let stored = service.get_api_key(created.key_id).unwrap();
    assert_eq!(stored.usage_count, 1);
    assert!(stored.last_used_at.is_some());
}

#[test]
fn test_unknown_key_is_rejected() {
    let (_clock, service) = memory_service();
    let (never_stored, _) = service.generate_api_key();
    assert!(matches!(
        service.authenticate(&never_stored),
        Err(ApiError::UnknownApiKey)
    ));
}

#[test]
fn test_revoked_key_fails_authentication() {
    let (clock, service) = memory_service();
    let created = service
        .create_api_key(
            CreateApiKeyRequest {
                expires_at: Some(clock_now(&clock) + Duration::days(30)),
                ..request("svc", &["api:read"])
            },
            "admin",
        )
        .unwrap();

    service
        .revoke_api_key(created.key_id, "admin", Some("unused".to_string()))
        .unwrap();

    let err = service.authenticate(&created.api_key).unwrap_err();
    assert!(matches!(err, ApiError::KeyRevoked));
    assert!(err.is_auth_error());

    let stored = service.get_api_key(created.key_id).unwrap();
    assert_eq!(stored.status, ApiKeyStatus::Revoked);
    assert_eq!(stored.revoked_by.as_deref(), Some("admin"));
    assert_eq!(stored.revocation_reason.as_deref(), Some("unused"));
    assert_eq!(stored.revoked_at, Some(clock_now(&clock)));

    // 二回目の失効は成功扱い、最初の記録を保持する
    clock.advance(Duration::minutes(5));
    service
        .revoke_api_key(created.key_id, "someone-else", None)
        .unwrap();
    let stored = service.get_api_key(created.key_id).unwrap();
    assert_eq!(stored.revoked_by.as_deref(), Some("admin"));

    // 失効は終端状態
    assert!(matches!(
        service.set_api_key_status(created.key_id, ApiKeyStatus::Active),
        Err(ApiError::InvalidRequest(_))
    ));
}

#[test]
fn test_revoke_unknown_key() {
    let (_clock, service) = memory_service();
    let missing = uuid::Uuid::new_v4();
    assert!(matches!(
        service.revoke_api_key(missing, "admin", None),
        Err(ApiError::KeyNotFound(id)) if id == missing
    ));
}

#[test]
fn test_expired_key_fails_authentication() {
    let (clock, service) = memory_service();
    let created = service
        .create_api_key(
            CreateApiKeyRequest {
                expires_at: Some(clock_now(&clock) + Duration::hours(1)),
                ..request("svc", &["api:read"])
            },
            "admin",
        )
        .unwrap();

    assert!(service.authenticate(&created.api_key).is_ok());
    clock.advance(Duration::hours(1));

    assert!(matches!(
        service.authenticate(&created.api_key),
        Err(ApiError::KeyExpired)
    ));
    assert_eq!(
        service.get_api_key(created.key_id).unwrap().status,
        ApiKeyStatus::Active
    );
}

#[test]
fn test_past_expiry_is_rejected() {
    let (clock, service) = memory_service();
    let result = service.create_api_key(
        CreateApiKeyRequest {
            expires_at: Some(clock_now(&clock) - Duration::seconds(1)),
            ..request("svc", &["api:read"])
        },
        "admin",
    );
    assert!(matches!(result, Err(ApiError::InvalidRequest(_))));
}

#[test]
fn test_disable_and_enable() {
    let (_clock, service) = memory_service();
    let created = service
        .create_api_key(request("svc", &["api:*"]), "admin")
        .unwrap();

    let disabled = service
        .set_api_key_status(created.key_id, ApiKeyStatus::Inactive)
        .unwrap();
    assert_eq!(disabled.status, ApiKeyStatus::Inactive);
    assert!(matches!(
        service.authenticate(&created.api_key),
        Err(ApiError::KeyInactive)
    ));

    service
        .set_api_key_status(created.key_id, ApiKeyStatus::Active)
        .unwrap();
    assert!(service.authenticate(&created.api_key).is_ok());

    assert!(matches!(
        service.set_api_key_status(created.key_id, ApiKeyStatus::Revoked),
        Err(ApiError::InvalidRequest(_))
    ));
}

fn exercise_listing(service: &ApiKeyService, clock: &ManualClock) {
    let mut ids = Vec::new();
    for i in 0..5 {
        let created = service
            .create_api_key(request(&format!("svc-{}", i), &["api:read"]), "admin")
            .unwrap();
        ids.push(created.key_id);
        clock.advance(Duration::seconds(1));
    }
    service.revoke_api_key(ids[1], "admin", None).unwrap();

    let all = service
        .list_api_keys(ApiKeyFilter::default(), Pagination::new(Some(2), Some(1)))
        .unwrap();
    assert_eq!(all.total, 5);
    assert_eq!((all.limit, all.skip), (2, 1));
    let names: Vec<&str> = all.api_keys.iter().map(|k| k.name.as_str()).collect();
    assert_eq!(names, vec!["svc-3", "svc-2"]);

    let revoked = service
        .list_api_keys(
            ApiKeyFilter {
                status: Some(ApiKeyStatus::Revoked),
            },
            Pagination::default(),
        )
        .unwrap();
    assert_eq!(revoked.total, 1);
    assert_eq!(revoked.api_keys[0].id, ids[1]);

    let active = service
        .list_api_keys(
            ApiKeyFilter {
                status: Some(ApiKeyStatus::Active),
            },
            Pagination::default(),
        )
        .unwrap();
    assert_eq!(active.total, 4);

    // ハッシュは一覧に出さない
    let json = serde_json::to_value(&all).unwrap();
    assert!(json["apiKeys"][0].get("keyHash").is_none());
    assert!(json["apiKeys"][0].get("name").is_some());
}

#[test]
fn test_listing_with_memory_store() {
    let (clock, service) = memory_service();
    exercise_listing(&service, &clock);
}

#[test]
fn test_listing_with_sqlite_store() {
    let db = Database::in_memory().expect("Failed to create test database");
    let (clock, service) = service_with(Arc::new(db));
    exercise_listing(&service, &clock);
}

// 既に失効済みのキーへの再失効は最初の記録を上書きしない
fn exercise_second_revocation_keeps_first(store: Arc<dyn ApiKeyStore>) {
    let (clock, service) = service_with(store.clone());
    let created = service
        .create_api_key(request("svc", &["api:read"]), "admin")
        .unwrap();

    let first = Revocation {
        revoked_by: "alice".to_string(),
        revoked_at: clock_now(&clock),
        reason: Some("leaked".to_string()),
    };
    let second = Revocation {
        revoked_by: "bob".to_string(),
        revoked_at: clock_now(&clock) + Duration::minutes(1),
        reason: None,
    };
    assert!(store
        .set_status(created.key_id, ApiKeyStatus::Revoked, Some(&first))
        .unwrap());
    assert!(store
        .set_status(created.key_id, ApiKeyStatus::Revoked, Some(&second))
        .unwrap());

    let stored = service.get_api_key(created.key_id).unwrap();
    assert_eq!(stored.status, ApiKeyStatus::Revoked);
    assert_eq!(stored.revoked_by.as_deref(), Some("alice"));
    assert_eq!(stored.revoked_at, Some(first.revoked_at));
    assert_eq!(stored.revocation_reason.as_deref(), Some("leaked"));
}

#[test]
fn test_memory_store_keeps_first_revocation() {
    exercise_second_revocation_keeps_first(Arc::new(MemoryApiKeyStore::new()));
}

#[test]
fn test_sqlite_store_keeps_first_revocation() {
    let db = Database::in_memory().expect("Failed to create test database");
    exercise_second_revocation_keeps_first(Arc::new(db));
}

#[test]
fn test_sqlite_round_trips_key_record() {
    let db = Database::in_memory().expect("Failed to create test database");
    let (clock, service) = service_with(Arc::new(db));

    let mut restrictions = Restrictions {
        allowed_ips: vec!["10.1.1.1".to_string()],
        ..Default::default()
    };
    restrictions
        .extra
        .insert("note".to_string(), serde_json::json!("partner"));

    let created = service
        .create_api_key(
            CreateApiKeyRequest {
                description: Some("nightly sync".to_string()),
                rate_limit: Some(RateLimitPolicy::per_minute(5)),
                restrictions: Some(restrictions.clone()),
                expires_at: Some(clock_now(&clock) + Duration::days(7)),
                ..request("sync", &["api:*", "admin:read"])
            },
            "ops",
        )
        .unwrap();

    let key = service.authenticate(&created.api_key).unwrap();
    assert_eq!(key.description.as_deref(), Some("nightly sync"));
    assert_eq!(key.permissions, perms(&["api:*", "admin:read"]));
    assert_eq!(key.rate_limit, Some(RateLimitPolicy::per_minute(5)));
    assert_eq!(key.restrictions, Some(restrictions));
    assert_eq!(key.expires_at, Some(clock_now(&clock) + Duration::days(7)));
    assert_eq!(key.created_by, "ops");

    service
        .revoke_api_key(created.key_id, "ops", Some("rotated".into()))
        .unwrap();
    assert!(matches!(
        service.authenticate(&created.api_key),
        Err(ApiError::KeyRevoked)
    ));
    assert!(matches!(
        service.set_api_key_status(created.key_id, ApiKeyStatus::Inactive),
        Err(ApiError::InvalidRequest(_))
    ));
}

#[test]
fn test_admin_token_round_trip() {
    let tokens = AdminTokenService::new("test_secret_key".to_string(), Duration::hours(1));
    let token = tokens.issue_admin_token("alice").unwrap();

    let claims = tokens.validate_admin_token(&token).unwrap();
    assert_eq!(claims.sub, "alice");
    assert_eq!(claims.role, "admin");

    let other = AdminTokenService::new("other_secret".to_string(), Duration::hours(1));
    assert!(matches!(
        other.validate_admin_token(&token),
        Err(ApiError::InvalidToken)
    ));
    assert!(tokens.validate_admin_token("not-a-jwt").is_err());
}

#[test]
fn test_admin_token_expiry_follows_clock() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let tokens = AdminTokenService::with_clock(
        "test_secret_key".to_string(),
        Duration::hours(1),
        clock.clone(),
    );
    let token = tokens.issue_admin_token("alice").unwrap();
    let claims = tokens.validate_admin_token(&token).unwrap();
    assert_eq!(claims.iat, clock_now(&clock).timestamp());
    assert_eq!(claims.exp, (clock_now(&clock) + Duration::hours(1)).timestamp());

    clock.advance(Duration::minutes(59));
    assert!(tokens.validate_admin_token(&token).is_ok());

    clock.advance(Duration::minutes(1));
    assert!(matches!(
        tokens.validate_admin_token(&token),
        Err(ApiError::TokenExpired)
    ));
}

#[test]
fn test_expired_admin_token() {
    let tokens = AdminTokenService::new("test_secret_key".to_string(), Duration::hours(-2));
    let token = tokens.issue_admin_token("alice").unwrap();
    assert!(matches!(
        tokens.validate_admin_token(&token),
        Err(ApiError::TokenExpired)
    ));
}

#[test]
fn test_config_from_lookup() {
    let config = Config::from_lookup(|name| match name {
        "BIND_ADDR" => Some("0.0.0.0:8080".to_string()),
        "RATE_LIMIT_CLEANUP_SECS" => Some("15".to_string()),
        "ISSUE_ADMIN_TOKEN" => Some("true".to_string()),
        _ => None,
    })
    .unwrap();
    assert_eq!(config.bind_addr, "0.0.0.0:8080");
    assert_eq!(config.cleanup_interval_secs, 15);
    assert!(config.issue_admin_token);
    assert_eq!(config.api_key_prefix, "lcp");
    assert!(config.uses_dev_secret());

    assert_eq!(config.admin_token_ttl().unwrap(), Duration::hours(12));

    let bad = Config::from_lookup(|name| {
        (name == "ADMIN_TOKEN_TTL_HOURS").then(|| "soon".to_string())
    });
    assert!(bad.is_err());

    // キーは '_' で分割されるので、区切り文字を含む値は拒否
    for (var, value) in [
        ("API_KEY_PREFIX", "my_app"),
        ("API_KEY_ENVIRONMENT", "us_east"),
        ("API_KEY_PREFIX", ""),
        ("API_KEY_ENVIRONMENT", "  "),
    ] {
        let result = Config::from_lookup(|name| (name == var).then(|| value.to_string()));
        assert!(
            matches!(result, Err(ConfigError::Invalid { name, .. }) if name == var),
            "{}={:?} should be rejected",
            var,
            value
        );
    }

    let custom = Config::from_lookup(|name| match name {
        "API_KEY_PREFIX" => Some("acme".to_string()),
        "API_KEY_ENVIRONMENT" => Some("prod".to_string()),
        _ => None,
    })
    .unwrap();
    let service = ApiKeyService::new(
        Arc::new(MemoryApiKeyStore::new()),
        custom.api_key_prefix,
        custom.api_key_environment,
    );
    let created = service
        .create_api_key(request("svc", &["api:read"]), "admin")
        .unwrap();
    assert!(created.api_key.starts_with("acme_prod_v1_"));
    assert!(service.authenticate(&created.api_key).is_ok());
}

#[test]
fn test_config_rejects_out_of_range_admin_token_ttl() {
    for value in ["0", "-3", "8761", "9000000000000000"] {
        let result = Config::from_lookup(|name| {
            (name == "ADMIN_TOKEN_TTL_HOURS").then(|| value.to_string())
        });
        assert!(
            matches!(
                result,
                Err(ConfigError::Invalid { name: "ADMIN_TOKEN_TTL_HOURS", .. })
            ),
            "ttl {} should be rejected",
            value
        );
    }

    let config = Config::from_lookup(|name| {
        (name == "ADMIN_TOKEN_TTL_HOURS").then(|| "8760".to_string())
    })
    .unwrap();
    assert_eq!(config.admin_token_ttl().unwrap(), Duration::hours(8760));
}

fn clock_now(clock: &ManualClock) -> chrono::DateTime<Utc> {
    community_gate::Clock::now(clock)
}
