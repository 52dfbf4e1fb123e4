//! End-to-end tests: compile CML source, run it on entities, verify the
//! observable effects through the engine and arena.

use cml_runtime::types::ESCAPE_STATUS;
use cml_runtime::Error;
use cml_tests::TestHarness;

const EPS: f64 = 1e-9;

#[test]
fn wait_suspends_for_exactly_its_count() {
    let mut h = TestHarness::new();
    let (_e, f) = h.start("w10");
    h.ticks(9);
    assert!(h.fiber_alive(f), "still waiting on the ninth tick");
    h.tick();
    assert!(!h.fiber_alive(f), "done on the tenth");
}

#[test]
fn wait_without_an_argument_reuses_the_last() {
    let mut h = TestHarness::new();
    let (_e, f) = h.start("w3 v1,0 w");
    h.ticks(5);
    assert!(h.fiber_alive(f));
    h.tick();
    assert!(!h.fiber_alive(f));
}

#[test]
fn long_wait_uses_its_own_timer() {
    let mut h = TestHarness::new();
    let (_e, f) = h.start("w2 ~3");
    h.ticks(4);
    assert!(h.fiber_alive(f));
    h.tick();
    assert!(!h.fiber_alive(f));
}

#[test]
fn hex_literals_count_like_decimals() {
    let mut h = TestHarness::new();
    let (_e, f) = h.start("w0x10");
    h.ticks(15);
    assert!(h.fiber_alive(f));
    h.tick();
    assert!(!h.fiber_alive(f));
}

#[test]
fn loops_expose_their_counter() {
    let mut h = TestHarness::new();
    let log = h.recorder("log");
    let (_e, f) = h.start("[&log$l w1]3");
    h.ticks(4);
    assert_eq!(*log.borrow(), vec![0.0, 1.0, 2.0]);
    assert!(!h.fiber_alive(f));
}

#[test]
fn countless_loops_run_forever() {
    let mut h = TestHarness::new();
    let (_e, f) = h.start("[w1]");
    h.ticks(50);
    assert!(h.fiber_alive(f));
}

#[test]
fn a_loop_without_a_wait_is_destroyed() {
    let mut h = TestHarness::new();
    let program = h.compile("[v1]");
    let e = h.spawn_at(0.0, 0.0);
    assert!(matches!(
        h.try_run_on(&program, e),
        Err(Error::MissingWait { .. })
    ));
    assert_eq!(h.engine.active_count(), 0);
}

#[test]
fn empty_programs_spawn_nothing() {
    let mut h = TestHarness::new();
    let program = h.compile("// just a comment");
    let e = h.spawn_at(0.0, 0.0);
    assert_eq!(h.try_run_on(&program, e).unwrap(), None);
}

#[test]
fn fire_launches_along_the_heading() {
    let mut h = TestHarness::new();
    let program = h.compile("ha90 f3{w10}");
    let e = h.spawn_at(2.0, 5.0);
    h.run_on(&program, e, &[]);

    assert_eq!(h.world.live_count(), 2);
    // The firing fiber exhausts its program at spawn; only the projectile's
    // fiber survives.
    assert_eq!(h.engine.active_count(), 1);
    let (_, shot) = h.world.iter().find(|(s, _)| *s != e).unwrap();
    assert!(shot.vel_x.abs() < EPS);
    assert!((shot.vel_y - 3.0).abs() < EPS);
    assert_eq!((shot.pos_x, shot.pos_y), (2.0, 5.0));
    assert_eq!(shot.parent, e);
}

#[test]
fn a_bare_fire_reuses_the_attached_sequence() {
    let mut h = TestHarness::new();
    let (_e, _f) = h.start("ha90 f3{w10} f2 w5");
    assert_eq!(h.world.live_count(), 3);
    assert_eq!(h.engine.active_count(), 3);
}

#[test]
fn fibers_fired_mid_tick_keep_running() {
    let mut h = TestHarness::new();
    let log = h.recorder("mark");
    h.start("w1 f3{w5 &mark}");
    h.ticks(6);
    assert_eq!(*log.borrow(), vec![1.0], "the fired fiber must resume");
    assert_eq!(h.engine.active_count(), 0);
}

#[test]
fn new_spawns_a_child_in_place() {
    let mut h = TestHarness::new();
    let program = h.compile("n{p8,9 w10}");
    let e = h.spawn_at(1.0, 1.0);
    h.run_on(&program, e, &[]);
    let (_, child) = h.world.iter().find(|(s, _)| *s != e).unwrap();
    assert_eq!((child.pos_x, child.pos_y), (8.0, 9.0));
    assert_eq!((child.vel_x, child.vel_y), (0.0, 0.0));
}

#[test]
fn inline_calls_pass_positional_arguments() {
    let mut h = TestHarness::new();
    let (e, f) = h.start("#sub{v$1,$2} &sub3,4");
    assert_eq!((h.entity(e).vel_x, h.entity(e).vel_y), (3.0, 4.0));
    assert!(!h.fiber_alive(f), "nothing left to run");
}

#[test]
fn unbounded_recursion_trips_the_nesting_limit() {
    let mut h = TestHarness::new();
    let program = h.compile("#rec{&rec} &rec");
    let e = h.spawn_at(0.0, 0.0);
    assert!(matches!(
        h.try_run_on(&program, e),
        Err(Error::NestingTooDeep { .. })
    ));
}

#[test]
fn rank_assignments_hit_the_entity() {
    let mut h = TestHarness::new();
    let (e, _f) = h.start("$r=5 $r+=2");
    assert_eq!(h.entity(e).rank, 7.0);
}

#[test]
fn the_invert_flag_mirrors_positions() {
    let mut h = TestHarness::new();
    let (e, _f) = h.start("m3 p1,2");
    assert_eq!((h.entity(e).pos_x, h.entity(e).pos_y), (-1.0, -2.0));
}

#[test]
fn the_invert_flag_mirrors_headings() {
    let mut h = TestHarness::new();
    let program = h.compile("m1 ha90 f3{w10}");
    let e = h.spawn_at(0.0, 0.0);
    h.run_on(&program, e, &[]);
    let (_, shot) = h.world.iter().find(|(s, _)| *s != e).unwrap();
    assert!(shot.vel_x.abs() < EPS);
    assert!((shot.vel_y + 3.0).abs() < EPS, "fires down instead of up");
}

#[test]
fn aimed_velocity_points_at_the_default_target() {
    let mut h = TestHarness::new();
    let t = h.spawn_at(10.0, 0.0);
    h.engine.set_default_target(t);
    let program = h.compile("vd5");
    let e = h.spawn_at(0.0, 0.0);
    h.run_on(&program, e, &[]);
    assert!((h.entity(e).vel_x - 5.0).abs() < EPS);
    assert!(h.entity(e).vel_y.abs() < EPS);
}

#[test]
fn forked_fibers_inherit_parameters() {
    let mut h = TestHarness::new();
    let probe = h.recorder("probe");
    h.start("i9 @{&probe$i} w5");
    assert_eq!(*probe.borrow(), vec![9.0]);
}

#[test]
fn plain_forks_start_fresh() {
    let mut h = TestHarness::new();
    let probe = h.recorder("probe");
    h.start("i9 @o{&probe$i} w5");
    assert_eq!(*probe.borrow(), vec![0.0]);
}

#[test]
fn a_same_id_fork_replaces_the_previous_child() {
    let mut h = TestHarness::new();
    h.start("@1{w100} @1{w100} w1");
    assert_eq!(h.engine.active_count(), 2);
}

#[test]
fn unidentified_forks_accumulate() {
    let mut h = TestHarness::new();
    h.start("@{w100} @{w100} w1");
    assert_eq!(h.engine.active_count(), 3);
}

#[test]
fn kill_fiber_takes_the_subtree_with_it() {
    let mut h = TestHarness::new();
    let (_e, f) = h.start("@{w100} kf");
    assert!(!h.fiber_alive(f));
    assert_eq!(h.engine.active_count(), 0);
}

#[test]
fn kill_object_marks_with_the_given_status() {
    let mut h = TestHarness::new();
    let (e, _f) = h.start("ko5");
    assert_eq!(h.world.destruction_status(e), Some(5));
}

#[test]
fn destruction_handlers_fire_on_the_status() {
    let mut h = TestHarness::new();
    let log = h.recorder("boom");
    let (e, _f) = h.start("@ko{&boom} w100");
    h.ticks(2);
    assert!(log.borrow().is_empty());

    h.world.destroy(e, 9);
    h.tick();
    assert_eq!(*log.borrow(), vec![1.0]);

    // The slot frees and every fiber on it unwinds.
    h.ticks(2);
    assert!(!h.world.is_live(e));
    assert_eq!(h.engine.active_count(), 0);
}

#[test]
fn destruction_handlers_filter_on_their_access_id() {
    let mut h = TestHarness::new();
    let log = h.recorder("boom");
    let (e, _f) = h.start("@ko2{&boom} w100");
    h.world.destroy(e, 1);
    h.ticks(3);
    assert!(log.borrow().is_empty());
}

#[test]
fn destroying_an_entitys_fibers_leaves_the_rest_alone() {
    let mut h = TestHarness::new();
    let (_a, fa) = h.start("w100");
    let (b, fb) = h.start("@{w100} w100");
    h.engine.destroy_all_on(b);
    assert!(h.fiber_alive(fa));
    assert!(!h.fiber_alive(fb));
    assert_eq!(h.engine.active_count(), 1);
}

#[test]
fn execute_can_preset_the_invert_flag() {
    let mut h = TestHarness::new();
    let program = h.compile("p1,2");
    let e = h.spawn_at(0.0, 0.0);
    h.engine
        .execute_inverted(&program, e, &[], 3, &mut h.world, &h.globals)
        .unwrap();
    assert_eq!((h.entity(e).pos_x, h.entity(e).pos_y), (-1.0, -2.0));
}

#[test]
fn fibers_on_a_freed_entity_unwind() {
    let mut h = TestHarness::new();
    let (e, f) = h.start("w100");
    h.world.free(e);
    h.tick();
    assert!(!h.fiber_alive(f));
    assert_eq!(h.engine.active_count(), 0);
}

#[test]
fn entities_leaving_the_screen_are_culled() {
    let mut h = TestHarness::new();
    h.globals.set_screen_size(100.0, 100.0);
    let (e, _f) = h.start("v60,0 w100");
    h.tick();
    assert_eq!(h.world.destruction_status(e), Some(ESCAPE_STATUS));
}

#[test]
fn user_accessors_feed_formulas() {
    let mut h = TestHarness::new();
    h.globals.register_accessor("level", |_| 2.0);
    let (e, _f) = h.start("v$level,$level*2");
    assert_eq!((h.entity(e).vel_x, h.entity(e).vel_y), (2.0, 4.0));
}

#[test]
fn seeded_runs_are_deterministic() {
    let mut h = TestHarness::new();
    let program = h.compile("v$?*100,$??*100");

    h.globals.seed_random(7);
    let a = h.spawn_at(0.0, 0.0);
    h.run_on(&program, a, &[]);
    let first = (h.entity(a).vel_x, h.entity(a).vel_y);

    h.globals.seed_random(7);
    let b = h.spawn_at(0.0, 0.0);
    h.run_on(&program, b, &[]);
    assert_eq!((h.entity(b).vel_x, h.entity(b).vel_y), first);
}

#[test]
fn top_level_arguments_reach_the_root_sequence() {
    let mut h = TestHarness::new();
    let program = h.compile("v$1,$2");
    let e = h.spawn_at(0.0, 0.0);
    h.run_on(&program, e, &[6.0, 8.0]);
    assert_eq!((h.entity(e).vel_x, h.entity(e).vel_y), (6.0, 8.0));
}

#[test]
fn interval_reads_back_through_its_accessor() {
    let mut h = TestHarness::new();
    let (_e, f) = h.start("i7 w$i");
    h.ticks(6);
    assert!(h.fiber_alive(f));
    h.tick();
    assert!(!h.fiber_alive(f));
}
