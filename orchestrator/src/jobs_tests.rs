#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::config::Config;
    use crate::database::timestamp;
    use crate::models::{DomainStatus, ServiceRole, ServiceStatus, TaskStatus};
    use crate::platform::{BackupReport, Visibility};
    use crate::runner::{TaskOutcome, TaskRunner};
    use crate::sites::Preallocated;
    use crate::testing::{Fixture, test_config};

    // ─── Helpers ───────────────────────────────────────────────────────

    async fn run_next(fx: &Fixture) -> Option<TaskOutcome> {
        TaskRunner::new(fx.orchestrator.clone(), "test-runner")
            .run_once(Utc::now())
            .await
            .unwrap()
    }

    /// A site installed and configured, assigned to `owner@example.org`.
    async fn live_site(fx: &Fixture) -> Preallocated {
        let site = fx.orchestrator.preallocate(fx.server_type_id).await.unwrap();
        assert_eq!(run_next(fx).await, Some(TaskOutcome::Succeeded));
        fx.orchestrator
            .assign_site(site.site_id, "dept-site", "owner@example.org", None)
            .await
            .unwrap();

        let vm = fx
            .orchestrator
            .store()
            .vm_for_service(site.production_service_id)
            .await
            .unwrap()
            .unwrap();
        fx.orchestrator
            .post_installation(vm.id, &vm.token)
            .await
            .unwrap();
        // configure, then the "available" notification
        assert_eq!(run_next(fx).await, Some(TaskOutcome::Succeeded));
        assert_eq!(run_next(fx).await, Some(TaskOutcome::Succeeded));
        site
    }

    async fn queued_kinds(fx: &Fixture) -> Vec<String> {
        let mut kinds: Vec<_> = fx
            .orchestrator
            .tasks()
            .list(Some(TaskStatus::Queued), 100)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect();
        kinds.sort();
        kinds
    }

    // ─── Preallocation sweep ───────────────────────────────────────────

    #[tokio::test]
    async fn preallocation_sweep_tops_up_one_site_per_run() {
        let fx = Fixture::new().await;
        fx.fill_pool(5).await;
        let store = fx.orchestrator.store();
        let large = store
            .insert_server_type("large", 2, 4, 40, 2)
            .await
            .unwrap();

        let first = fx.orchestrator.preallocation_sweep().await.unwrap();
        assert_eq!(first.created.len(), 1);
        assert_eq!(store.count_preallocated_sites(large).await.unwrap(), 1);

        fx.orchestrator.preallocation_sweep().await.unwrap();
        assert_eq!(store.count_preallocated_sites(large).await.unwrap(), 2);

        let third = fx.orchestrator.preallocation_sweep().await.unwrap();
        assert!(third.created.is_empty());
        assert_eq!(store.count_preallocated_sites(large).await.unwrap(), 2);
        assert_eq!(
            store
                .count_preallocated_sites(fx.server_type_id)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn preallocation_sweep_reports_exhaustion() {
        let fx = Fixture::new().await;
        fx.orchestrator
            .store()
            .insert_server_type("large", 2, 4, 40, 1)
            .await
            .unwrap();

        let report = fx.orchestrator.preallocation_sweep().await.unwrap();
        assert!(report.created.is_empty());
        assert_eq!(report.failed, 1);
    }

    // ─── Upgrades ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn due_site_gets_a_test_server_and_leaves_the_queue() {
        let fx = Fixture::new().await;
        fx.fill_pool(2).await;
        let site = live_site(&fx).await;
        let store = fx.orchestrator.store();
        store
            .set_setting(site.production_service_id, "os", "jessie")
            .await
            .unwrap();
        assert!(fx.orchestrator.enqueue_upgrade(site.site_id).await.unwrap());
        assert!(!fx.orchestrator.enqueue_upgrade(site.site_id).await.unwrap());

        let report = fx.orchestrator.dequeue_upgrades().await.unwrap();
        assert_eq!(report.started, Some(site.site_id));
        assert!(store.upgrade_queue().await.unwrap().is_empty());
        assert_eq!(queued_kinds(&fx).await, vec!["clone_test_service", "notify"]);

        assert_eq!(run_next(&fx).await, Some(TaskOutcome::Succeeded));
        let test = store
            .service_by_role(site.site_id, ServiceRole::Test)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(test.status, ServiceStatus::Installing);
        assert_eq!(store.count_active_test_services().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sites_not_due_stay_queued() {
        let fx = Fixture::new().await;
        fx.fill_pool(1).await;
        let site = live_site(&fx).await;
        fx.orchestrator.enqueue_upgrade(site.site_id).await.unwrap();

        // Installed with the default OS, which is not due.
        let report = fx.orchestrator.dequeue_upgrades().await.unwrap();
        assert_eq!(report.started, None);
        assert_eq!(fx.orchestrator.store().upgrade_queue().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_sites_are_dropped_from_the_queue() {
        let fx = Fixture::new().await;
        fx.fill_pool(1).await;
        let site = live_site(&fx).await;
        fx.orchestrator.enqueue_upgrade(site.site_id).await.unwrap();
        fx.orchestrator
            .cancel_site(site.site_id, Utc::now().date_naive())
            .await
            .unwrap();

        let report = fx.orchestrator.dequeue_upgrades().await.unwrap();
        assert_eq!(report.started, None);
        assert_eq!(report.dropped, vec![site.site_id]);
        assert!(fx.orchestrator.store().upgrade_queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upgrades_wait_while_the_ceiling_is_reached() {
        let fx = Fixture::with_config(Config {
            max_pending_upgrades: 1,
            ..test_config()
        })
        .await;
        fx.fill_pool(2).await;
        let site = live_site(&fx).await;
        let store = fx.orchestrator.store();
        store
            .set_setting(site.production_service_id, "os", "jessie")
            .await
            .unwrap();
        fx.orchestrator.clone_test_service(site.site_id).await.unwrap();
        assert_eq!(store.count_active_test_services().await.unwrap(), 1);
        fx.orchestrator.enqueue_upgrade(site.site_id).await.unwrap();

        let report = fx.orchestrator.dequeue_upgrades().await.unwrap();
        assert_eq!(report.started, None);
        assert_eq!(store.upgrade_queue().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_test_server_puts_the_site_back_in_the_queue() {
        let fx = Fixture::new().await;
        // The only host address goes to the production VM.
        fx.fill_pool(1).await;
        let site = live_site(&fx).await;
        let store = fx.orchestrator.store();
        store
            .set_setting(site.production_service_id, "os", "jessie")
            .await
            .unwrap();
        fx.orchestrator.enqueue_upgrade(site.site_id).await.unwrap();

        let report = fx.orchestrator.dequeue_upgrades().await.unwrap();
        assert_eq!(report.started, Some(site.site_id));
        assert!(store.upgrade_queue().await.unwrap().is_empty());

        let runner = TaskRunner::new(fx.orchestrator.clone(), "test-runner");
        let mut now = Utc::now();
        let mut abandoned = false;
        for _ in 0..8 {
            if runner.run_once(now).await.unwrap() == Some(TaskOutcome::Abandoned) {
                abandoned = true;
                break;
            }
            now = now + Duration::minutes(11);
        }
        assert!(abandoned);

        let queue = store.upgrade_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].site_id, site.site_id);
        assert_eq!(store.count_active_test_services().await.unwrap(), 0);
    }

    // ─── Domains ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn unanswered_domain_requests_are_settled_after_the_grace_period() {
        let fx = Fixture::new().await;
        fx.fill_pool(1).await;
        let site = live_site(&fx).await;
        let store = fx.orchestrator.store();
        let vhost = store
            .ensure_vhost(site.production_service_id, "default")
            .await
            .unwrap();
        let now = Utc::now();
        let old = timestamp(now - Duration::days(31));

        let free = store
            .ensure_domain(vhost.id, "www.dept.example.org", DomainStatus::Requested, &old)
            .await
            .unwrap();
        let taken = store
            .ensure_domain(vhost.id, "taken.example.org", DomainStatus::Requested, &old)
            .await
            .unwrap();
        let fresh = store
            .ensure_domain(vhost.id, "new.example.org", DomainStatus::Requested, &timestamp(now))
            .await
            .unwrap();
        fx.platform().registrar.set_nameinfo("taken.example.org", "A");

        let report = fx.orchestrator.resolve_domain_requests(now).await.unwrap();
        assert_eq!(report.accepted, vec![free.id]);
        assert_eq!(report.denied, vec![taken.id]);

        let status = |id: i64| async move { store.domain(id).await.unwrap().unwrap().status };
        assert_eq!(status(free.id).await, DomainStatus::Accepted);
        assert_eq!(status(taken.id).await, DomainStatus::Denied);
        assert_eq!(status(fresh.id).await, DomainStatus::Requested);
    }

    #[tokio::test]
    async fn validation_follows_visibility() {
        let fx = Fixture::new().await;
        fx.fill_pool(1).await;
        let site = live_site(&fx).await;
        let store = fx.orchestrator.store();
        let vhost = store
            .ensure_vhost(site.production_service_id, "default")
            .await
            .unwrap();
        let primary = store
            .domain(vhost.main_domain_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        let now = Utc::now();
        let external = store
            .ensure_domain(vhost.id, "ext.example.com", DomainStatus::External, &timestamp(now))
            .await
            .unwrap();

        fx.platform().resolver.set(&primary.name, Visibility::Global);
        fx.platform().resolver.set("ext.example.com", Visibility::Private);
        let report = fx.orchestrator.validate_domains(now).await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.changed, 1);
        assert_eq!(
            store.domain(primary.id).await.unwrap().unwrap().status,
            DomainStatus::Global
        );
        assert_eq!(
            store.domain(external.id).await.unwrap().unwrap().status,
            DomainStatus::External
        );

        let later = now + Duration::days(1);
        fx.platform().resolver.set(&primary.name, Visibility::Invisible);
        fx.platform().resolver.set("ext.example.com", Visibility::Invisible);
        fx.orchestrator.validate_domains(later).await.unwrap();

        for id in [primary.id, external.id] {
            let domain = store.domain(id).await.unwrap().unwrap();
            assert_eq!(domain.status, DomainStatus::Deleted);
            assert_eq!(domain.updated_at, timestamp(later));
        }

        // Still invisible the next day: not re-stamped.
        fx.orchestrator
            .validate_domains(later + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(
            store.domain(primary.id).await.unwrap().unwrap().updated_at,
            timestamp(later)
        );
    }

    #[tokio::test]
    async fn deleted_domain_is_purged_after_grace_with_one_reconfiguration() {
        let fx = Fixture::new().await;
        fx.fill_pool(1).await;
        let site = live_site(&fx).await;
        let store = fx.orchestrator.store();
        let grace = fx.orchestrator.config().domain_grace_days;
        let vhost = store
            .ensure_vhost(site.production_service_id, "default")
            .await
            .unwrap();
        let now = Utc::now();

        let expired = store
            .ensure_domain(
                vhost.id,
                "gone.example.org",
                DomainStatus::Deleted,
                &timestamp(now - Duration::days(grace + 1)),
            )
            .await
            .unwrap();
        let pending = store
            .ensure_domain(
                vhost.id,
                "soon.example.org",
                DomainStatus::Deleted,
                &timestamp(now - Duration::days(grace - 1)),
            )
            .await
            .unwrap();
        store.set_main_domain(vhost.id, Some(expired.id)).await.unwrap();

        let report = fx.orchestrator.expire_domains(now).await.unwrap();
        assert_eq!(report.purged, vec![expired.id]);
        assert!(report.warned.is_empty());

        assert!(store.domain(expired.id).await.unwrap().is_none());
        assert!(store.domain(pending.id).await.unwrap().is_some());
        assert_eq!(store.vhost(vhost.id).await.unwrap().unwrap().main_domain_id, None);

        assert_eq!(queued_kinds(&fx).await, vec!["configure", "notify"]);
        assert_eq!(
            store
                .service(site.production_service_id)
                .await
                .unwrap()
                .unwrap()
                .status,
            ServiceStatus::AnsibleQueued
        );
    }

    #[tokio::test]
    async fn owners_are_warned_on_schedule_days() {
        let fx = Fixture::new().await;
        fx.fill_pool(1).await;
        let site = live_site(&fx).await;
        let store = fx.orchestrator.store();
        let vhost = store
            .ensure_vhost(site.production_service_id, "default")
            .await
            .unwrap();
        let now = Utc::now();

        let warned = store
            .ensure_domain(
                vhost.id,
                "warn.example.org",
                DomainStatus::Deleted,
                &timestamp(now - Duration::days(12)),
            )
            .await
            .unwrap();
        store
            .ensure_domain(
                vhost.id,
                "quiet.example.org",
                DomainStatus::Deleted,
                &timestamp(now - Duration::days(13)),
            )
            .await
            .unwrap();

        let report = fx.orchestrator.expire_domains(now).await.unwrap();
        assert_eq!(report.warned, vec![warned.id]);
        assert!(report.purged.is_empty());
        assert_eq!(queued_kinds(&fx).await, vec!["notify"]);
    }

    // ─── Backups ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn backup_audit_flags_failed_and_missing_hosts() {
        let fx = Fixture::new().await;
        fx.fill_pool(1).await;
        let site = live_site(&fx).await;
        let vm = fx
            .orchestrator
            .store()
            .vm_for_service(site.production_service_id)
            .await
            .unwrap()
            .unwrap();
        let name = vm.name.clone().unwrap();
        let audit_day = Utc::now() + Duration::days(3);

        *fx.platform().backups.report.lock().unwrap() = BackupReport {
            ok: vec![],
            failed: vec!["xen-other.example.org".to_string()],
        };
        let report = fx.orchestrator.audit_backups(audit_day).await.unwrap();
        assert_eq!(report.failed_hosts, vec!["xen-other.example.org"]);
        assert_eq!(report.missing, vec![name.clone()]);

        *fx.platform().backups.report.lock().unwrap() = BackupReport {
            ok: vec![format!("{name}.mws.example.org")],
            failed: vec![],
        };
        let report = fx.orchestrator.audit_backups(audit_day).await.unwrap();
        assert!(report.missing.is_empty());

        // Sites started yesterday or later are not expected yet.
        let report = fx.orchestrator.audit_backups(Utc::now()).await;
        assert!(report.unwrap().missing.is_empty());
    }

    #[tokio::test]
    async fn disabled_sites_are_not_audited() {
        let fx = Fixture::new().await;
        fx.fill_pool(1).await;
        let site = live_site(&fx).await;
        fx.orchestrator.disable_site(site.site_id).await.unwrap();
        assert_eq!(queued_kinds(&fx).await, vec!["power"]);

        let report = fx
            .orchestrator
            .audit_backups(Utc::now() + Duration::days(3))
            .await
            .unwrap();
        assert!(report.missing.is_empty());
    }

    // ─── Tasks ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stale_tasks_are_recovered_after_the_visibility_timeout() {
        let fx = Fixture::new().await;
        fx.fill_pool(1).await;
        fx.orchestrator.preallocate(fx.server_type_id).await.unwrap();
        let now = Utc::now();
        fx.orchestrator.tasks().claim(now).await.unwrap().unwrap();

        assert_eq!(fx.orchestrator.recover_stale_tasks(now).await.unwrap(), 0);
        let later = now + Duration::hours(2);
        assert_eq!(fx.orchestrator.recover_stale_tasks(later).await.unwrap(), 1);
        assert_eq!(queued_kinds(&fx).await, vec!["create_primary"]);
    }
}
