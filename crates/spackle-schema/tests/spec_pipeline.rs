use spackle_schema::{
    parse, parse_one_or_raise, specfile, tokenize, topological_sort, ConcreteSpec, DepFlag,
    ParseError, PinnedConcretizer, Concretizer, TokenizationError,
};

#[test]
fn text_to_concrete_spec_and_back() {
    let abstract_spec =
        parse_one_or_raise("hdf5@1.14.3%gcc@13.2+mpi ^[deptypes=build,link] zlib@1.3", None)
            .unwrap();
    let concrete = PinnedConcretizer.concretize(&abstract_spec).unwrap();
    assert_eq!(concrete.dependencies().len(), 1);
    assert_eq!(
        concrete.dependencies()[0].depflag,
        DepFlag::BUILD | DepFlag::LINK
    );
    assert!(concrete.satisfies(&abstract_spec));

    let again = ConcreteSpec::freeze(&abstract_spec).unwrap();
    assert_eq!(again.dag_hash(), concrete.dag_hash());
}

#[test]
fn spec_file_reference_splices_concrete_spec() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zlib.json");
    let zlib = ConcreteSpec::freeze(&parse_one_or_raise("zlib@1.3", None).unwrap()).unwrap();
    specfile::write_spec_file(&zlib, &path).unwrap();

    let text = format!("hdf5@1.14 ^{}", path.display());
    let spec = parse_one_or_raise(&text, None).unwrap();
    let dep = &spec.dependencies()[0].spec;
    assert!(dep.is_concrete());
    assert_eq!(dep.as_concrete().unwrap().dag_hash(), zlib.dag_hash());
}

#[test]
fn missing_spec_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let text = format!("hdf5 ^{}", dir.path().join("gone.yaml").display());
    let err = parse_one_or_raise(&text, None).unwrap_err();
    assert!(matches!(err, ParseError::SpecFile(_)));
    assert!(err.to_string().contains("No such spec file"));
}

#[test]
fn batches_of_specs_on_one_line() {
    let specs = parse("zlib@1.3 hdf5+mpi ^mpich openssl").unwrap();
    let names: Vec<_> = specs.iter().map(|s| s.name().unwrap()).collect();
    assert_eq!(names, ["zlib", "hdf5", "openssl"]);
    assert_eq!(specs[1].dependencies().len(), 1);
}

#[test]
fn tokenization_error_marks_bad_span() {
    assert!(tokenize("").next().is_none());
    let err: TokenizationError = tokenize("zlib ?? +debug")
        .find_map(Result::err)
        .unwrap();
    assert_eq!(err.unexpected_spans(), vec![(5, 7)]);
    let rendered = err.to_string();
    assert!(rendered.contains("zlib ?? +debug"));
    assert!(rendered.contains("^^"));
}

#[test]
fn sort_of_a_frozen_spec() {
    let spec = parse_one_or_raise(
        "app@1 ^libb@1 ^libc@1 ^[deptypes=build] cmake@3.27",
        None,
    )
    .unwrap();
    let frozen = ConcreteSpec::freeze(&spec).unwrap();
    let order = topological_sort(&frozen, DepFlag::ALL, false).unwrap();
    assert_eq!(order.last().map(String::as_str), Some("app"));
    let reversed = topological_sort(&frozen, DepFlag::ALL, true).unwrap();
    assert_eq!(reversed[0], "app");
    assert_eq!(reversed.len(), 4);
}
