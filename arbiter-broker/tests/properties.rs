// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashSet;
use std::time::Duration;

use arbiter_broker::testing::{Fixture, kinds, token_for, volume, whole_disk};
use arbiter_broker::{RequestState, SubmitSpec};
use arbiter_contracts::{
    ArbitrationError, ArbitrationErrorKind, CallbackArgument, CallbackInstance, CompletionStatus,
    Dissenter,
};
use arbiter_types::description::keys;
use arbiter_types::{
    CallbackKind, CallerInfo, DiskId, RequestKind, RequestOption, ResponseId, SessionId,
    SessionOption,
};
use serde_json::json;

fn response_id(queue: &[CallbackInstance]) -> ResponseId {
    queue
        .iter()
        .find_map(CallbackInstance::response_id)
        .expect("an approval instance")
}

fn outcome(instance: &CallbackInstance) -> &CompletionStatus {
    match &instance.argument {
        CallbackArgument::Outcome(status) => status,
        other => panic!("expected an outcome, got {other:?}"),
    }
}

fn failed_with(status: &CompletionStatus) -> Option<ArbitrationErrorKind> {
    match status {
        CompletionStatus::Failed(error) => Some(error.kind),
        _ => None,
    }
}

fn assert_single_pending(fx: &Fixture) {
    let mut awaiting = HashSet::new();
    for request in fx.broker.queue().iter() {
        if request.state() == RequestState::AwaitingApproval {
            assert!(
                awaiting.insert(request.disk().clone()),
                "two requests awaiting approval on {}",
                request.disk()
            );
        }
    }
    for row in fx.broker.responses().rows() {
        assert!(fx.broker.responses().has_pending(&row.disk));
    }
}

#[test]
fn whole_disk_semantics_on_a_volume_are_unsupported() {
    let mut fx = Fixture::new();
    let files = fx.session("files");
    fx.appear(whole_disk("sdb"));
    let partition = fx.appear(volume("sdb1", "sdb"));

    let error = fx
        .submit(files, RequestKind::Eject, &partition)
        .expect_err("eject of a volume");
    assert_eq!(error.kind, ArbitrationErrorKind::Unsupported);

    let mut spec = SubmitSpec::new(RequestKind::Unmount, partition.clone(), CallerInfo::new(1000, 1000));
    spec.options = RequestOption::Whole.into();
    spec.callback = Some(token_for(CallbackKind::Unmount));
    let error = fx.broker.submit(files, spec).expect_err("whole unmount of a volume");
    assert_eq!(error.kind, ArbitrationErrorKind::Unsupported);

    let queue = fx.drain(files);
    assert_eq!(kinds(&queue), vec![CallbackKind::Eject, CallbackKind::Unmount]);
    for instance in &queue {
        assert_eq!(failed_with(outcome(instance)), Some(ArbitrationErrorKind::Unsupported));
    }
    assert!(fx.broker.queue().is_empty());
    assert!(fx.stage.jobs().is_empty());
}

#[test]
fn unregistered_callbacks_never_fire_and_leave_no_rows() {
    let mut fx = Fixture::new();
    let voter = fx.session("voter");
    let requester = fx.session("requester");
    let sdb = fx.appear(whole_disk("sdb"));
    let sdc = fx.appear(whole_disk("sdc"));
    let token = fx.subscribe(voter, CallbackKind::MountApproval);

    fx.submit(requester, RequestKind::Mount, &sdb).expect("mount sdb");
    assert_eq!(fx.broker.responses().rows_for(&sdb), 1);
    fx.drain(voter);

    fx.broker.unregister(voter, token).expect("unregister");
    assert!(fx.broker.responses().rows().is_empty());
    assert_eq!(fx.stage.jobs().len(), 1, "released vote lets the mount proceed");

    fx.submit(requester, RequestKind::Mount, &sdc).expect("mount sdc");
    assert!(fx.drain(voter).is_empty());
    assert!(fx.broker.responses().rows().is_empty());
}

#[test]
fn unregistered_completion_is_not_delivered() {
    let mut fx = Fixture::new();
    let requester = fx.session("requester");
    let sdb = fx.appear(whole_disk("sdb"));
    let token = fx.subscribe(requester, CallbackKind::Mount);

    let request = fx.submit(requester, RequestKind::Mount, &sdb).expect("mount");
    assert_eq!(fx.broker.request(request).map(|r| r.state()), Some(RequestState::Dispatched));

    fx.broker.unregister(requester, token).expect("unregister");
    assert!(fx.broker.request(request).is_some_and(|r| r.callback().is_none()));

    fx.finish_stage(&sdb, CompletionStatus::Success);
    assert!(fx.drain(requester).is_empty());
    assert!(fx.broker.queue().is_empty());
}

#[test]
fn one_pending_response_per_disk_across_interleavings() {
    let mut fx = Fixture::new();
    let voter = fx.session("voter");
    let first = fx.session("first");
    let second = fx.session("second");
    let sdb = fx.appear(whole_disk("sdb"));
    let sdc = fx.appear(whole_disk("sdc"));
    fx.subscribe(voter, CallbackKind::MountApproval);
    fx.subscribe(voter, CallbackKind::UnmountApproval);
    fx.subscribe(voter, CallbackKind::EjectApproval);

    fx.submit(first, RequestKind::Mount, &sdb).expect("mount");
    assert_single_pending(&fx);
    let unmount = fx.submit(second, RequestKind::Unmount, &sdb).expect("unmount");
    assert_single_pending(&fx);
    assert_eq!(fx.broker.request(unmount).map(|r| r.state()), Some(RequestState::Queued));

    fx.submit(second, RequestKind::Eject, &sdc).expect("eject");
    assert_single_pending(&fx);
    assert_eq!(fx.broker.responses().pending_count(), 2);

    let votes = fx.drain(voter);
    assert_eq!(votes.len(), 2);
    for instance in &votes {
        let disk = instance.disk.as_ref().map(|disk| disk.id.clone()).expect("disk");
        let id = instance.response_id().expect("response id");
        fx.broker.respond(voter, &disk, id, None).expect("respond");
        assert_single_pending(&fx);
    }

    // Mount on sdb is running, so the unmount waits without a vote.
    assert!(!fx.broker.responses().has_pending(&sdb));
    fx.finish_stage(&sdb, CompletionStatus::Success);
    assert_single_pending(&fx);
    assert!(fx.broker.responses().has_pending(&sdb));

    fx.broker.release_session(second).expect("release");
    assert_single_pending(&fx);
    assert!(!fx.broker.responses().has_pending(&sdb));
}

#[test]
fn first_dissent_wins_and_completion_fires_once() {
    let mut fx = Fixture::new();
    let voters: Vec<SessionId> = ["a", "b", "c"].iter().map(|name| fx.session(name)).collect();
    let requester = fx.session("requester");
    let sdb = fx.appear(whole_disk("sdb"));
    for voter in &voters {
        fx.subscribe(*voter, CallbackKind::MountApproval);
    }

    fx.submit(requester, RequestKind::Mount, &sdb).expect("mount");
    assert_eq!(fx.broker.responses().rows_for(&sdb), 3);

    let ids: Vec<ResponseId> = voters.iter().map(|voter| response_id(&fx.drain(*voter))).collect();
    let veto = Dissenter::new(0xF8DA_0010, Some("in use".to_string()));

    fx.broker
        .respond(voters[0], &sdb, ids[0], Some(veto.clone()))
        .expect("dissent");
    fx.broker
        .respond(voters[1], &sdb, ids[1], Some(Dissenter::new(1, None)))
        .expect("late dissent");
    assert!(fx.drain(requester).is_empty());
    fx.broker.respond(voters[2], &sdb, ids[2], None).expect("approve");

    let queue = fx.drain(requester);
    assert_eq!(kinds(&queue), vec![CallbackKind::Mount]);
    assert_eq!(outcome(&queue[0]), &CompletionStatus::Dissented(veto));
    assert!(fx.stage.jobs().is_empty());

    // A repeated vote is an orphan and fires nothing.
    fx.broker.respond(voters[2], &sdb, ids[2], None).expect("orphan");
    assert!(fx.drain(requester).is_empty());
    assert!(fx.broker.responses().is_empty());
}

#[test]
fn sessions_that_opt_out_never_time_out() {
    let mut fx = Fixture::new();
    let slow = fx.session("slow");
    let requester = fx.session("requester");
    let sdb = fx.appear(whole_disk("sdb"));
    fx.subscribe(slow, CallbackKind::MountApproval);
    fx.broker
        .set_session_options(slow, SessionOption::NoTimeout.into())
        .expect("options");

    fx.submit(requester, RequestKind::Mount, &sdb).expect("mount");
    assert_eq!(fx.broker.next_deadline(), None);

    fx.clock.advance(Duration::from_secs(3600));
    fx.broker.on_timer();
    assert_eq!(fx.broker.responses().rows_for(&sdb), 1);
    assert!(fx.stage.jobs().is_empty());
    assert!(!fx.broker.session(slow).is_some_and(|s| s.is_timed_out()));
}

#[test]
fn timed_out_votes_count_as_approval() {
    let mut fx = Fixture::new();
    let slow = fx.session("slow");
    let requester = fx.session("requester");
    let sdb = fx.appear(whole_disk("sdb"));
    fx.subscribe(slow, CallbackKind::MountApproval);

    fx.submit(requester, RequestKind::Mount, &sdb).expect("mount");
    let issued = fx.broker.responses().rows()[0].issued;
    let config = *fx.broker.config();
    assert_eq!(
        fx.broker.next_deadline(),
        Some(issued + config.response_timeout + config.timer_leeway)
    );

    fx.clock.advance(config.response_timeout / 2);
    fx.broker.on_timer();
    assert_eq!(fx.broker.responses().rows_for(&sdb), 1);

    fx.clock.advance(config.response_timeout + config.timer_leeway);
    fx.broker.on_timer();
    assert!(fx.broker.responses().is_empty());
    assert_eq!(fx.stage.jobs().len(), 1);
    assert!(fx.broker.session(slow).is_some_and(|s| s.is_timed_out()));

    // Timed-out sessions are not asked again until they drain.
    let sdc = fx.appear(whole_disk("sdc"));
    fx.submit(requester, RequestKind::Mount, &sdc).expect("mount sdc");
    assert_eq!(fx.stage.jobs().len(), 2);

    assert_eq!(kinds(&fx.drain(slow)), vec![CallbackKind::MountApproval]);
    assert!(!fx.broker.session(slow).is_some_and(|s| s.is_timed_out()));
}

#[test]
fn releasing_a_session_completes_its_votes() {
    let mut fx = Fixture::new();
    let voter = fx.session("voter");
    let requester = fx.session("requester");
    let disks: Vec<DiskId> = ["sdb", "sdc", "sdd"].iter().map(|id| fx.appear(whole_disk(id))).collect();
    fx.subscribe(voter, CallbackKind::MountApproval);

    for disk in &disks {
        fx.submit(requester, RequestKind::Mount, disk).expect("mount");
    }
    assert_eq!(fx.broker.responses().rows().len(), 3);

    fx.broker.release_session(voter).expect("release");
    assert!(fx.broker.session(voter).is_none());
    assert!(fx.broker.responses().is_empty());

    let started: Vec<DiskId> = fx.stage.jobs().into_iter().map(|job| job.disk).collect();
    assert_eq!(started, disks);
    assert!(fx.drain(requester).is_empty(), "no completion before the stage reports");
}

#[test]
fn whole_unmount_fans_out_to_siblings() {
    let mut fx = Fixture::new();
    let requester = fx.session("requester");
    let sdb = fx.appear(whole_disk("sdb"));
    let volumes: Vec<DiskId> = ["sdb1", "sdb2", "sdb3"]
        .iter()
        .map(|id| fx.appear(volume(id, "sdb")))
        .collect();
    fx.appear(volume("sdc1", "sdc"));

    let mut spec = SubmitSpec::new(RequestKind::Unmount, sdb.clone(), CallerInfo::new(1000, 4242));
    spec.options = RequestOption::Whole.into();
    spec.callback = Some(token_for(CallbackKind::Unmount));
    let parent = fx.broker.submit(requester, spec).expect("whole unmount");

    assert_eq!(fx.broker.queue().len(), 4);
    let links: Vec<DiskId> = fx
        .broker
        .request(parent)
        .map(|request| request.links().iter().map(|link| link.disk.clone()).collect())
        .unwrap_or_default();
    assert_eq!(links, volumes);
    for request in fx.broker.queue().iter() {
        assert_eq!(request.caller().pid, 4242);
        if request.id() != parent {
            assert_eq!(request.parent(), Some(parent));
            assert!(request.callback().is_none());
        }
    }

    let jobs: Vec<DiskId> = fx.stage.jobs().into_iter().map(|job| job.disk).collect();
    assert_eq!(jobs, volumes);

    fx.finish_stage(&volumes[0], CompletionStatus::Success);
    let failure = ArbitrationError::new(ArbitrationErrorKind::Busy, "target is busy");
    fx.finish_stage(&volumes[1], CompletionStatus::Failed(failure.clone()));

    let parent_links = fx.broker.request(parent).map(|r| r.links().to_vec()).unwrap_or_default();
    assert_eq!(parent_links[0].outcome, Some(CompletionStatus::Success));
    assert_eq!(parent_links[1].outcome, Some(CompletionStatus::Failed(failure.clone())));
    assert_eq!(parent_links[2].outcome, None);
    assert!(
        fx.broker
            .queue()
            .iter()
            .any(|request| request.disk() == &volumes[2] && request.state() == RequestState::Dispatched)
    );
    assert!(fx.drain(requester).is_empty());

    fx.finish_stage(&volumes[2], CompletionStatus::Success);
    let queue = fx.drain(requester);
    assert_eq!(kinds(&queue), vec![CallbackKind::Unmount]);
    assert_eq!(outcome(&queue[0]), &CompletionStatus::Failed(failure));
    assert!(fx.broker.queue().is_empty());
    assert!(fx.stage.jobs().is_empty(), "parent never reached the stage");
}

#[test]
fn eject_unmounts_every_sibling_first() {
    let mut fx = Fixture::new();
    let voter = fx.session("voter");
    let requester = fx.session("requester");
    fx.subscribe(voter, CallbackKind::UnmountApproval);
    fx.subscribe(voter, CallbackKind::EjectApproval);
    let sdb = fx.appear(whole_disk("sdb"));
    let volumes: Vec<DiskId> = ["sdb1", "sdb2"].iter().map(|id| fx.appear(volume(id, "sdb"))).collect();

    let parent = fx.submit(requester, RequestKind::Eject, &sdb).expect("eject");
    assert_eq!(fx.broker.queue().len(), 3);
    for request in fx.broker.queue().iter().filter(|request| request.id() != parent) {
        assert_eq!(request.kind(), RequestKind::Unmount);
        assert_eq!(request.parent(), Some(parent));
    }

    let votes = fx.drain(voter);
    assert_eq!(kinds(&votes), vec![CallbackKind::UnmountApproval; 2]);
    for instance in &votes {
        let disk = instance.disk.as_ref().map(|disk| disk.id.clone()).expect("disk");
        assert!(volumes.contains(&disk));
        let id = instance.response_id().expect("response id");
        fx.broker.respond(voter, &disk, id, None).expect("approve unmount");
    }

    let jobs = fx.stage.jobs();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|job| job.kind == RequestKind::Unmount && volumes.contains(&job.disk)));
    for disk in &volumes {
        fx.finish_stage(disk, CompletionStatus::Success);
    }
    assert!(fx.drain(requester).is_empty());

    let votes = fx.drain(voter);
    assert_eq!(kinds(&votes), vec![CallbackKind::EjectApproval]);
    fx.broker
        .respond(voter, &sdb, response_id(&votes), None)
        .expect("approve eject");
    let jobs = fx.stage.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!((jobs[0].kind, &jobs[0].disk), (RequestKind::Eject, &sdb));

    fx.finish_stage(&sdb, CompletionStatus::Success);
    let queue = fx.drain(requester);
    assert_eq!(kinds(&queue), vec![CallbackKind::Eject]);
    assert_eq!(outcome(&queue[0]), &CompletionStatus::Success);
    assert!(fx.broker.queue().is_empty());
}

#[test]
fn dissent_on_a_sibling_stops_the_eject() {
    let mut fx = Fixture::new();
    let voter = fx.session("voter");
    let requester = fx.session("requester");
    fx.subscribe(voter, CallbackKind::UnmountApproval);
    let sdb = fx.appear(whole_disk("sdb"));
    let sdb1 = fx.appear(volume("sdb1", "sdb"));

    fx.submit(requester, RequestKind::Eject, &sdb).expect("eject");
    let veto = Dissenter::new(0xF8DA_0010, Some("files open".to_string()));
    let id = response_id(&fx.drain(voter));
    fx.broker
        .respond(voter, &sdb1, id, Some(veto.clone()))
        .expect("dissent");

    let queue = fx.drain(requester);
    assert_eq!(kinds(&queue), vec![CallbackKind::Eject]);
    assert_eq!(outcome(&queue[0]), &CompletionStatus::Dissented(veto));
    assert!(fx.stage.jobs().is_empty(), "nothing reached the stage");
    assert!(fx.broker.queue().is_empty());
}

#[test]
fn idle_fires_once_until_something_else_is_delivered() {
    let mut fx = Fixture::new();
    let watcher = fx.session("watcher");
    let worker = fx.session("worker");
    fx.subscribe(watcher, CallbackKind::Idle);
    assert_eq!(kinds(&fx.drain(watcher)), vec![CallbackKind::Idle]);

    fx.subscribe(watcher, CallbackKind::DescriptionChanged);
    let sdb = fx.appear(whole_disk("sdb"));

    for round in 0..2 {
        let mut description = fx.broker.copy_description(&sdb).expect("description");
        description.insert(keys::VOLUME_NAME.to_string(), json!(format!("round {round}")));
        fx.broker.disk_description_changed(&sdb, description);

        for _ in 0..2 {
            fx.submit(worker, RequestKind::Probe, &sdb).expect("probe");
            assert!(!fx.broker.is_idle());
            fx.finish_stage(&sdb, CompletionStatus::Success);
            assert!(fx.broker.is_idle());
        }

        assert_eq!(
            kinds(&fx.drain(watcher)),
            vec![CallbackKind::DescriptionChanged, CallbackKind::Idle]
        );
    }
}

#[test]
fn appeared_registration_replays_present_disks() {
    let mut fx = Fixture::new();
    let sdb = fx.appear(whole_disk("sdb"));
    let sdc = fx.appear(whole_disk("sdc"));
    let late = fx.session("late");

    fx.subscribe(late, CallbackKind::DiskAppeared);
    assert_eq!(
        fx.broker.session(late).map(|session| session.directory().queued_len()),
        Some(2)
    );
    let queue = fx.drain(late);
    assert_eq!(kinds(&queue), vec![CallbackKind::DiskAppeared; 2]);
    let replayed: Vec<DiskId> = queue
        .iter()
        .filter_map(|instance| instance.disk.as_ref().map(|disk| disk.id.clone()))
        .collect();
    assert_eq!(replayed, vec![sdb, sdc]);
}

#[test]
fn disk_removal_fails_running_requests_with_not_found() {
    let mut fx = Fixture::new();
    let requester = fx.session("requester");
    let sdb = fx.appear(whole_disk("sdb"));

    fx.submit(requester, RequestKind::Mount, &sdb).expect("mount");
    assert_eq!(fx.stage.jobs().len(), 1);

    fx.broker.disk_disappeared(&sdb);
    let queue = fx.drain(requester);
    assert_eq!(kinds(&queue), vec![CallbackKind::Mount]);
    assert_eq!(failed_with(outcome(&queue[0])), Some(ArbitrationErrorKind::NotFound));
    assert!(fx.broker.queue().is_empty());
    assert!(fx.broker.disk(&sdb).is_none());

    // The engine reporting late is dropped.
    fx.finish_stage(&sdb, CompletionStatus::Success);
    assert!(fx.drain(requester).is_empty());
}
