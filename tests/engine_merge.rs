mod common;

use cell_offload::script::Value;
use cell_offload::{GenerationOutcome, OutputEvent, SubmitRequest, TaskState};
use common::{Recording, TestResult, engine_config, local, new_engine, wait_idle};

fn repr(value: Option<&Value>) -> Option<String> {
    value.map(Value::repr)
}

#[tokio::test]
async fn new_binding_is_merged_into_default() -> TestResult<()> {
    local(async {
        let (engine, globals) = new_engine(engine_config()?);
        let out = Recording::default();
        out.attach(&engine, "cellA");

        let scheduled = engine.submit(SubmitRequest::new("cellA", "x = 1\n").with_key("cellA"))?;
        assert_eq!(scheduled.generation.0, 1);
        wait_idle(&engine).await?;
        assert_eq!(repr(globals.borrow().get("x")), Some("1".to_string()));

        let scheduled = engine.submit(SubmitRequest::new("cellA", "x = 2\n").with_key("cellA"))?;
        assert_eq!(scheduled.generation.0, 2);
        wait_idle(&engine).await?;
        assert_eq!(repr(globals.borrow().get("x")), Some("2".to_string()));
        assert_eq!(engine.last_outcome("cellA"), Some(GenerationOutcome::Completed));
        assert_eq!(engine.task_state("cellA"), TaskState::Idle);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn named_namespace_receives_the_diff() -> TestResult<()> {
    local(async {
        let (engine, globals) = new_engine(engine_config()?);
        engine.submit(
            SubmitRequest::new("cellB", "data = [1, 2, 3]\n")
                .with_key("cellB")
                .with_namespace("spaceA"),
        )?;
        wait_idle(&engine).await?;

        let space = engine.get_namespace("spaceA");
        assert_eq!(repr(space.get("data")), Some("[1, 2, 3]".to_string()));
        assert!(!globals.borrow().contains_key("data"));
        assert_eq!(engine.registry().names(), vec!["default", "spaceA"]);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn named_target_still_reads_host_globals() -> TestResult<()> {
    local(async {
        let (engine, globals) = new_engine(engine_config()?);
        globals.borrow_mut().insert("base".into(), Value::Int(10));
        engine.submit(
            SubmitRequest::new("out", "total = base + 1\n").with_namespace("spaceA"),
        )?;
        wait_idle(&engine).await?;
        assert_eq!(
            repr(engine.get_namespace("spaceA").get("total")),
            Some("11".to_string())
        );
        Ok(())
    })
    .await
}

#[tokio::test]
async fn partial_bindings_survive_an_exception() -> TestResult<()> {
    local(async {
        let (engine, globals) = new_engine(engine_config()?);
        let out = Recording::default();
        out.attach(&engine, "cellC");

        engine.submit(
            SubmitRequest::new("cellC", "partial = 5\nraise 'boom'\nnever = 1\n").with_key("cellC"),
        )?;
        wait_idle(&engine).await?;

        assert_eq!(repr(globals.borrow().get("partial")), Some("5".to_string()));
        assert!(!globals.borrow().contains_key("never"));
        let stderr = out.stderr_events().concat();
        assert!(stderr.contains("RuntimeError: boom"), "{stderr}");
        assert_eq!(engine.last_outcome("cellC"), Some(GenerationOutcome::Error));
        Ok(())
    })
    .await
}

#[tokio::test]
async fn unserializable_result_is_warned_about_once_and_not_merged() -> TestResult<()> {
    local(async {
        let (engine, globals) = new_engine(engine_config()?);
        let out = Recording::default();
        out.attach(&engine, "cellD");

        engine.submit(
            SubmitRequest::new("cellD", "it = iter([1, 2])\nkept = 3\n").with_key("cellD"),
        )?;
        wait_idle(&engine).await?;

        assert!(!globals.borrow().contains_key("it"));
        assert_eq!(repr(globals.borrow().get("kept")), Some("3".to_string()));
        let warnings: Vec<String> = out
            .stderr_events()
            .into_iter()
            .filter(|text| text.contains("'it'") || text.contains(": it"))
            .collect();
        assert_eq!(warnings.len(), 1, "{warnings:?}");
        assert!(warnings[0].starts_with("[Warning] Skipped non-serializable variables: it"));
        Ok(())
    })
    .await
}

#[tokio::test]
async fn unserializable_host_global_is_skipped_with_one_warning() -> TestResult<()> {
    local(async {
        let (engine, globals) = new_engine(engine_config()?);
        let out = Recording::default();
        out.attach(&engine, "cellE");
        {
            let mut interp_globals = globals.borrow_mut();
            let mut host = cell_offload::script::BufferHost::default();
            cell_offload::script::Interpreter::new(&mut interp_globals, &mut host)
                .run_source("gen = iter([1])\nplain = 4\n")?;
        }

        for _ in 0..2 {
            engine.submit(SubmitRequest::new("cellE", "seen = plain\n").with_key("cellE"))?;
            wait_idle(&engine).await?;
        }

        let warnings: Vec<String> = out
            .stderr_events()
            .into_iter()
            .filter(|text| text.contains("Skipping non-serializable global variable 'gen'"))
            .collect();
        assert_eq!(warnings.len(), 1, "{warnings:?}");
        assert!(warnings[0].contains("(type: iterator)"));
        assert_eq!(repr(globals.borrow().get("seen")), Some("4".to_string()));
        Ok(())
    })
    .await
}

#[tokio::test]
async fn unchanged_bindings_are_not_reported_as_transferred() -> TestResult<()> {
    local(async {
        let (engine, globals) = new_engine(engine_config()?.with_report_transfers(true));
        let out = Recording::default();
        out.attach(&engine, "cellF");
        globals.borrow_mut().insert("y".into(), Value::Int(10));

        engine.submit(SubmitRequest::new("cellF", "z = y + 1\n").with_key("cellF"))?;
        wait_idle(&engine).await?;

        let info: Vec<String> = out
            .stderr_events()
            .into_iter()
            .filter(|text| text.starts_with("[Info]"))
            .collect();
        assert_eq!(
            info,
            vec!["[Info] Variables from background task updated in namespace 'default': z\n"]
        );
        Ok(())
    })
    .await
}

#[tokio::test]
async fn status_lines_follow_the_generation() -> TestResult<()> {
    local(async {
        let (engine, _globals) = new_engine(engine_config()?);
        let out = Recording::default();
        out.attach(&engine, "cellG");
        let scheduled = engine.submit(SubmitRequest::new("cellG", "print('hi')\n").with_key("cellG"))?;
        wait_idle(&engine).await?;

        let statuses = out.statuses();
        assert_eq!(statuses.len(), 3, "{statuses:?}");
        assert_eq!(statuses[0], format!("Starting [{}]...", scheduled.label));
        assert_eq!(statuses[1], "Running");
        assert!(statuses[2].starts_with("Finished (Completed) - "), "{statuses:?}");
        assert_eq!(out.stdout(), "hi\n");
        Ok(())
    })
    .await
}

#[tokio::test]
async fn display_events_carry_mime_bundles() -> TestResult<()> {
    local(async {
        let (engine, _globals) = new_engine(engine_config()?);
        let out = Recording::default();
        out.attach(&engine, "cellH");
        engine.submit(
            SubmitRequest::new("cellH", "display(markdown('# Title'))\n").with_key("cellH"),
        )?;
        wait_idle(&engine).await?;

        let displays: Vec<OutputEvent> = out
            .events()
            .into_iter()
            .filter(|event| event.kind() == "display")
            .collect();
        assert_eq!(displays.len(), 1);
        let OutputEvent::Display { data, .. } = &displays[0] else {
            unreachable!();
        };
        assert_eq!(data.get("text/markdown").map(String::as_str), Some("# Title"));
        Ok(())
    })
    .await
}

#[tokio::test]
async fn functions_defined_in_the_background_are_callable_on_the_host() -> TestResult<()> {
    local(async {
        let (engine, globals) = new_engine(engine_config()?);
        engine.submit(SubmitRequest::new(
            "out",
            "scale = 3\ndef triple(n):\n    return n * scale\n",
        ))?;
        wait_idle(&engine).await?;

        let mut globals = globals.borrow_mut();
        let mut host = cell_offload::script::BufferHost::default();
        cell_offload::script::Interpreter::new(&mut globals, &mut host)
            .run_source("result = triple(5)\n")?;
        assert_eq!(repr(globals.get("result")), Some("15".to_string()));
        Ok(())
    })
    .await
}
