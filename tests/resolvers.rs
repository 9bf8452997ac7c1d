use std::cell::Cell;
use std::io::Write;
use std::rc::Rc;

use databag::bag::Bag;
use databag::catalog::Value;
use databag::error::BagError;
use databag::resolve::{
    DirectoryOptions, FetchedDoc, ManualClock, ResolveContext, Resolver,
};

fn counting(counter: &Rc<Cell<u32>>) -> impl FnMut(&ResolveContext) -> databag::error::Result<Value> {
    let counter = counter.clone();
    move |_| {
        counter.set(counter.get() + 1);
        Ok(Value::Long(counter.get() as i64))
    }
}

#[test]
fn zero_cache_time_recomputes_every_read() {
    let bag = Bag::new();
    let calls = Rc::new(Cell::new(0));
    bag.set_callback_item("tick", 0.0, counting(&calls)).unwrap();
    assert_eq!(bag.get_item("tick"), Some(Value::Long(1)));
    assert_eq!(bag.get_item("tick"), Some(Value::Long(2)));
    assert_eq!(calls.get(), 2);
}

#[test]
fn positive_cache_time_expires_after_the_ttl() {
    let bag = Bag::new();
    let clock = ManualClock::starting_now();
    let calls = Rc::new(Cell::new(0));
    let node = bag.set_item("slow", Value::Null).unwrap();
    node.set_resolver(Resolver::callback(10.0, counting(&calls)).with_clock(clock.clone()));
    assert_eq!(bag.get_item("slow"), Some(Value::Long(1)));
    clock.advance(5.0);
    assert_eq!(bag.get_item("slow"), Some(Value::Long(1)));
    clock.advance(6.0);
    assert_eq!(bag.get_item("slow"), Some(Value::Long(2)));
    assert_eq!(calls.get(), 2);
}

#[test]
fn negative_cache_time_caches_forever() {
    let bag = Bag::new();
    let clock = ManualClock::starting_now();
    let calls = Rc::new(Cell::new(0));
    let node = bag.set_item("once", Value::Null).unwrap();
    node.set_resolver(Resolver::callback(-1.0, counting(&calls)).with_clock(clock.clone()));
    bag.get_item("once");
    clock.advance(1e6);
    assert_eq!(bag.get_item("once"), Some(Value::Long(1)));
    assert_eq!(calls.get(), 1);
}

#[test]
fn reset_resolver_forces_a_recompute() {
    let bag = Bag::new();
    let calls = Rc::new(Cell::new(0));
    let node = bag.set_callback_item("v", -1.0, counting(&calls)).unwrap();
    assert_eq!(bag.get_item("v"), Some(Value::Long(1)));
    assert_eq!(bag.get_item("v"), Some(Value::Long(1)));
    node.reset_resolver();
    assert_eq!(bag.get_item("v"), Some(Value::Long(2)));
}

#[test]
fn resolved_value_lands_in_the_node() {
    let bag = Bag::new();
    let node = bag
        .set_callback_item("v", -1.0, |_| Ok(Value::Long(9)))
        .unwrap();
    assert_eq!(node.static_value(), Value::Null);
    bag.get_item("v");
    assert_eq!(node.static_value(), Value::Long(9));
}

#[test]
fn read_only_resolvers_store_nothing() {
    let bag = Bag::new();
    let calls = Rc::new(Cell::new(0));
    let node = bag.set_item("v", Value::Null).unwrap();
    node.set_resolver(Resolver::callback(-1.0, counting(&calls)).with_read_only(true));
    assert_eq!(bag.get_item("v"), Some(Value::Long(1)));
    assert_eq!(bag.get_item("v"), Some(Value::Long(2)));
    assert_eq!(node.static_value(), Value::Null);
}

#[test]
fn resolver_failures_propagate_or_log() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let bag = Bag::new();
    bag.set_callback_item("bad", 0.0, |_| {
        Err(BagError::Resolve("backend gone".to_string()))
    })
    .unwrap();
    assert!(matches!(
        bag.try_get_item("bad"),
        Err(BagError::Resolve(_))
    ));
    // the infallible reader degrades to a miss
    assert_eq!(bag.get_item("bad"), None);
}

#[test]
fn formula_over_sibling_values() {
    let bag = Bag::new();
    bag.set_item("a", 10i64).unwrap();
    bag.set_item("b", 4.0f64).unwrap();
    bag.formula_item("avg", "($a + $b) / 2", &[("a", "a"), ("b", "b")])
        .unwrap();
    assert_eq!(bag.get_item("avg"), Some(Value::Real(7.0)));
    bag.set_item("a", 20i64).unwrap();
    assert_eq!(bag.get_item("avg"), Some(Value::Real(12.0)));
}

#[test]
fn named_formulas_and_symbols() {
    let bag = Bag::new();
    bag.set_item("data.total", 30i64).unwrap();
    bag.set_item("data.count", 3i64).unwrap();
    bag.define_symbol("total", "data.total").unwrap();
    bag.define_symbol("count", "data.count").unwrap();
    bag.define_formula("mean", "$t / $n").unwrap();
    bag.formula_item("mean", "mean", &[("t", "total"), ("n", "count")])
        .unwrap();
    assert_eq!(bag.get_item("mean"), Some(Value::Real(10.0)));
}

#[test]
fn underscore_symbols_force_fresh_targets() {
    let bag = Bag::new();
    let calls = Rc::new(Cell::new(0));
    bag.set_callback_item("tick", -1.0, counting(&calls)).unwrap();
    bag.formula_item("cached", "$t * 10", &[("t", "tick")]).unwrap();
    bag.formula_item("fresh", "$_t * 10", &[("t", "tick")]).unwrap();
    assert_eq!(bag.get_item("cached"), Some(Value::Real(10.0)));
    assert_eq!(bag.get_item("cached"), Some(Value::Real(10.0)));
    assert_eq!(calls.get(), 1);
    assert_eq!(bag.get_item("fresh"), Some(Value::Real(20.0)));
    assert_eq!(bag.get_item("fresh"), Some(Value::Real(30.0)));
}

#[test]
fn formula_on_non_numeric_symbol_fails() {
    let bag = Bag::new();
    bag.set_item("name", "office").unwrap();
    bag.formula_item("out", "$x + 1", &[("x", "name")]).unwrap();
    assert!(matches!(
        bag.try_get_item("out"),
        Err(BagError::Resolve(_))
    ));
}

#[test]
fn url_resolver_wraps_data_and_headers() {
    let bag = Bag::new();
    let hits = Rc::new(Cell::new(0));
    let node = bag.set_item("page", Value::Null).unwrap();
    let counter = hits.clone();
    node.set_resolver(Resolver::url("http://example.test/doc", move |url| {
        counter.set(counter.get() + 1);
        assert_eq!(url, "http://example.test/doc");
        Ok(FetchedDoc {
            data: "<html/>".to_string(),
            headers: vec![("content-type".to_string(), "text/html".to_string())],
        })
    }));
    assert_eq!(
        bag.get_item("page.data"),
        Some(Value::Text("<html/>".into()))
    );
    // the default ttl keeps the fetched document around
    assert_eq!(
        bag.get_item("page.info.content-type"),
        Some(Value::Text("text/html".into()))
    );
    assert_eq!(hits.get(), 1);
}

#[test]
fn url_resolver_caches_within_its_ttl() {
    let bag = Bag::new();
    let clock = ManualClock::starting_now();
    let hits = Rc::new(Cell::new(0));
    let node = bag.set_item("page", Value::Null).unwrap();
    let counter = hits.clone();
    let mut resolver = Resolver::url("http://example.test/doc", move |_| {
        counter.set(counter.get() + 1);
        Ok(FetchedDoc {
            data: format!("body {}", counter.get()),
            headers: vec![],
        })
    });
    resolver.set_cache_time(5.0);
    node.set_resolver(resolver.with_clock(clock.clone()));

    assert_eq!(
        bag.get_item("page.data"),
        Some(Value::Text("body 1".into()))
    );
    clock.advance(3.0);
    assert_eq!(
        bag.get_item("page.data"),
        Some(Value::Text("body 1".into()))
    );
    assert_eq!(hits.get(), 1);

    clock.advance(3.0);
    assert_eq!(
        bag.get_item("page.data"),
        Some(Value::Text("body 2".into()))
    );
    assert_eq!(hits.get(), 2);
}

fn scratch_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("databag-{}-{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn directory_resolver_mirrors_the_filesystem() {
    let dir = scratch_dir("dir");
    std::fs::write(dir.join("notes.txt"), "hello").unwrap();
    std::fs::write(dir.join("data.csv"), "a,b").unwrap();
    std::fs::write(dir.join(".hidden"), "x").unwrap();
    std::fs::create_dir(dir.join("sub")).unwrap();
    std::fs::write(dir.join("sub").join("inner.txt"), "deep").unwrap();

    let bag = Bag::new();
    let node = bag.set_item("fs", Value::Null).unwrap();
    node.set_resolver(Resolver::directory(
        &dir,
        DirectoryOptions {
            process: true,
            ..DirectoryOptions::default()
        },
    ));
    let fs = bag.get_bag("fs").unwrap();
    // sorted by file name, dot-files skipped
    assert_eq!(fs.keys(), vec!["data", "notes", "sub"]);
    assert_eq!(
        fs.get_attr("notes", "file_ext"),
        Some(Value::Text("txt".into()))
    );
    // text files become lazy documents when processing is on
    assert_eq!(fs.get_item("notes"), Some(Value::Text("hello".into())));
    assert_eq!(fs.get_item("sub.inner"), Some(Value::Text("deep".into())));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn directory_resolver_honors_include_patterns() {
    let dir = scratch_dir("inc");
    std::fs::write(dir.join("keep.txt"), "k").unwrap();
    std::fs::write(dir.join("drop.csv"), "d").unwrap();

    let bag = Bag::new();
    let node = bag.set_item("fs", Value::Null).unwrap();
    node.set_resolver(Resolver::directory(
        &dir,
        DirectoryOptions {
            include: "*.txt".to_string(),
            ..DirectoryOptions::default()
        },
    ));
    assert_eq!(bag.get_bag("fs").unwrap().keys(), vec!["keep"]);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn xml_document_resolver_loads_a_bag() {
    let dir = scratch_dir("xml");
    let path = dir.join("doc.xml");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(file, r#"<GenRoBag><n _T="L">5</n></GenRoBag>"#).unwrap();

    let bag = Bag::new();
    let node = bag.set_item("doc", Value::Null).unwrap();
    node.set_resolver(Resolver::xml_document(&path));
    assert_eq!(bag.get_item("doc.n"), Some(Value::Long(5)));
    let _ = std::fs::remove_dir_all(&dir);
}
