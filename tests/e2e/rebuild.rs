//! Incremental-build behavior: what reruns, what stays clean.

use crate::e2e::*;

#[cfg(unix)]
#[test]
fn chain_builds_once_then_is_clean() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            MARK_RULE,
            "build mid: mark in",
            "build out: mark mid",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;

    space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_eq!(space.mark_count("mid.stamp"), 1);
    assert_eq!(space.mark_count("out.stamp"), 1);
    assert!(space.read(".majak_log").is_ok());

    let out = space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");
    assert_eq!(space.mark_count("mid.stamp"), 1);
    assert_eq!(space.mark_count("out.stamp"), 1);
    Ok(())
}

#[cfg(unix)]
#[test]
fn touched_input_rebuilds_chain() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            MARK_RULE,
            "build mid: mark in",
            "build out: mark mid",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut majak_command(vec!["out"]))?;

    space.tick();
    space.write("in", "changed")?;
    space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_eq!(space.mark_count("mid.stamp"), 2);
    assert_eq!(space.mark_count("out.stamp"), 2);
    Ok(())
}

#[cfg(unix)]
#[test]
fn changed_command_rebuilds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let manifest = |cmd: &str| {
        format!(
            "rule mark\n  command = {}\nbuild mid: mark in\nbuild out: mark mid\n",
            cmd
        )
    };
    space.write(
        "build.ninja",
        &manifest("echo mark >> $out.stamp && touch $out"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_eq!(space.mark_count("mid.stamp"), 1);

    // Any byte of difference in the command must rerun both edges, even
    // though all files are up to date by mtime.
    space.write(
        "build.ninja",
        &manifest("echo mark  >> $out.stamp && touch $out"),
    )?;
    space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_eq!(space.mark_count("mid.stamp"), 2);
    assert_eq!(space.mark_count("out.stamp"), 2);
    Ok(())
}

#[cfg(unix)]
#[test]
fn generator_rule_ignores_command_changes() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let manifest = |cmd: &str| {
        format!(
            "rule gen\n  command = {}\n  generator = 1\nbuild out: gen in\n",
            cmd
        )
    };
    space.write("build.ninja", &manifest("touch $out"))?;
    space.write("in", "")?;
    space.run_expect(&mut majak_command(vec!["out"]))?;

    space.write("build.ninja", &manifest("touch $out # changed"))?;
    let out = space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");
    Ok(())
}

#[cfg(unix)]
#[test]
fn restat_noop_stops_propagation() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            "rule copy_if_changed",
            "  command = if ! cmp -s $in $out; then cp $in $out; fi",
            "  restat = 1",
            MARK_RULE,
            "build mid: copy_if_changed in",
            "build out: mark mid",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "same content")?;

    space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_eq!(space.mark_count("out.stamp"), 1);

    // Rewrite the input with identical bytes: the copy rule runs but leaves
    // mid untouched, so the downstream edge must not rerun.
    space.tick();
    space.write("in", "same content")?;
    space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_eq!(space.mark_count("out.stamp"), 1);

    // And the run after that is fully clean.
    let out = space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");

    // An actual content change still propagates.
    space.tick();
    space.write("in", "different content")?;
    space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_eq!(space.mark_count("out.stamp"), 2);
    Ok(())
}

#[cfg(unix)]
#[test]
fn order_only_deps_gate_but_do_not_dirty() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            MARK_RULE,
            "build gen: mark src",
            "build out: mark in || gen",
            "",
        ]
        .join("\n"),
    )?;
    space.write("src", "")?;
    space.write("in", "")?;
    space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_eq!(space.mark_count("out.stamp"), 1);

    // Touching the order-only dep rebuilds gen but not out.
    space.tick();
    space.write("src", "changed")?;
    space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_eq!(space.mark_count("gen.stamp"), 2);
    assert_eq!(space.mark_count("out.stamp"), 1);
    Ok(())
}

#[cfg(unix)]
#[test]
fn corrupt_log_recovers() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[MARK_RULE, "build out: mark in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut majak_command(vec!["out"]))?;

    // Chop the tail off the log, as a crash mid-write would.
    let log = space.read(".majak_log")?;
    std::fs::write(
        space.path().join(".majak_log"),
        &log[..log.len() - 3],
    )?;

    // The next build recovers (with a warning) and reruns what it no longer
    // has records for.
    let out = space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_stderr_contains(&out, "recovering");
    assert_eq!(space.mark_count("out.stamp"), 2);

    // After that the log is whole again.
    let out = space.run_expect(&mut majak_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");
    Ok(())
}

#[cfg(unix)]
#[test]
fn manifest_regeneration_restarts_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    // A manifest that rebuilds itself from a source file, then builds out.
    let gen = "rule regen\n  command = cat src.ninja > $out\n  generator = 1\n";
    space.write(
        "src.ninja",
        &[
            gen,
            TOUCH_RULE,
            "build build.ninja: regen src.ninja",
            "build out: touch in",
            "",
        ]
        .join("\n"),
    )?;
    space.write(
        "build.ninja",
        &[
            gen,
            TOUCH_RULE,
            "build build.ninja: regen src.ninja",
            "build old_out: touch in",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    space.tick();

    // src.ninja is newer than build.ninja, so majak regenerates the
    // manifest first and then builds from the NEW manifest.
    space.run_expect(&mut majak_command(vec!["out"]))?;
    assert!(space.read("out").is_ok());
    Ok(())
}
